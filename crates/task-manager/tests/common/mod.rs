//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::sync::broadcast;

use everruns_task_manager::prelude::*;
use everruns_task_manager::RunEventOutcome;

static INIT: Once = Once::new();

/// Initialize test logging once per test binary
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                std::env::var("RUST_LOG")
                    .unwrap_or_else(|_| "everruns_task_manager=debug".to_string()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Node settings tuned for fast tests
pub fn fast_config() -> TaskManagerConfig {
    TaskManagerConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_health_probe_interval(Duration::from_millis(20))
        .with_shutdown_timeout(Duration::from_secs(2))
}

/// Start a node over `backend` with `definitions`
pub fn start_node(
    backend: &Arc<InMemoryTaskDocumentStore>,
    node_id: &str,
    config: TaskManagerConfig,
    definitions: Vec<TaskDefinition>,
) -> TaskManagerStart {
    let mut manager = TaskManager::setup(config, node_id).expect("valid setup");
    manager
        .register_task_definitions(definitions)
        .expect("valid definitions");
    manager
        .start(Arc::clone(backend) as Arc<dyn TaskDocumentStore>)
        .expect("node starts")
}

/// Definition whose runs are counted and succeed
pub fn counting(task_type: &str, runs: Arc<AtomicUsize>) -> TaskDefinition {
    TaskDefinition::new(task_type, move |_ctx: RunContext| {
        let runs = Arc::clone(&runs);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(RunResult::done())
        }
    })
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next event matching `predicate`, or `None` on timeout
pub async fn next_event<F>(
    events: &mut broadcast::Receiver<TaskLifecycleEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<TaskLifecycleEvent>
where
    F: FnMut(&TaskLifecycleEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Outcome of the next completed run of `task_id`
pub async fn next_completion(
    events: &mut broadcast::Receiver<TaskLifecycleEvent>,
    task_id: &str,
) -> Option<RunEventOutcome> {
    match next_event(events, Duration::from_secs(5), |event| {
        matches!(event, TaskLifecycleEvent::TaskRunCompleted { task_id: id, .. } if id == task_id)
    })
    .await
    {
        Some(TaskLifecycleEvent::TaskRunCompleted { outcome, .. }) => Some(outcome),
        _ => None,
    }
}
