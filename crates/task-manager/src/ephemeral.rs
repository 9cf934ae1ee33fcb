//! Ephemeral task lifecycle
//!
//! Run-now tasks that never touch the store. They share the worker pool with
//! persisted tasks but leave `reserved_headroom` slots to the poller, and a
//! refused run is not retried.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EphemeralTasksConfig;
use crate::definition::{RunContext, TaskDefinition, TaskTypeDictionary};
use crate::error::TaskManagerError;
use crate::events::{emit, EventSender, RunEventOutcome, TaskLifecycleEvent};
use crate::task::EphemeralTask;
use crate::telemetry::{current_traceparent, set_parent_from_traceparent};
use crate::worker::{run_with_timeout, SlotRegistration, WorkerPool};

pub struct EphemeralTaskLifecycle {
    config: EphemeralTasksConfig,
    definitions: Arc<TaskTypeDictionary>,
    pool: Arc<WorkerPool>,
    events: EventSender,
    in_flight: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl EphemeralTaskLifecycle {
    pub fn new(
        config: EphemeralTasksConfig,
        definitions: Arc<TaskTypeDictionary>,
        pool: Arc<WorkerPool>,
        events: EventSender,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            definitions,
            pool,
            events,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Ephemeral runs currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start `task` right away, or refuse with `CapacityExceeded`
    ///
    /// Returns the run id carried by the run's lifecycle events
    /// (`ephemeral:<uuid>`).
    pub fn attempt_to_run(&self, task: EphemeralTask) -> Result<String, TaskManagerError> {
        if self.shutdown.is_cancelled() {
            return Err(TaskManagerError::Lifecycle(
                "task manager is shutting down".into(),
            ));
        }
        if !self.config.enabled {
            return Err(self.reject(&task.task_type, "ephemeral tasks are disabled"));
        }

        let definition = match self.definitions.ensure_registered(&task.task_type) {
            Ok(definition) => Arc::clone(definition),
            Err(err) => {
                emit(
                    &self.events,
                    TaskLifecycleEvent::TaskRejected {
                        task_type: task.task_type.clone(),
                        reason: err.to_string(),
                    },
                );
                return Err(err.into());
            }
        };

        let Some(request_guard) = RequestGuard::acquire(&self.in_flight, self.config.request_capacity)
        else {
            return Err(self.reject(
                &task.task_type,
                &format!(
                    "{} ephemeral runs already in flight",
                    self.config.request_capacity
                ),
            ));
        };

        let available = self.pool.available_slots();
        if available <= self.config.reserved_headroom {
            return Err(self.reject(
                &task.task_type,
                &format!(
                    "{available} free workers, {} reserved for persisted tasks",
                    self.config.reserved_headroom
                ),
            ));
        }

        let permit = match self
            .pool
            .try_admit(&task.task_type, definition.max_concurrency)
        {
            Ok(permit) => permit,
            Err(err) => return Err(self.reject(&task.task_type, &err.to_string())),
        };

        let run_id = TaskLifecycleEvent::ephemeral_run_id(Uuid::now_v7());
        let registration = SlotRegistration {
            task_id: run_id.clone(),
            task_type: task.task_type.clone(),
            ephemeral: true,
        };

        let span = info_span!(
            "ephemeral_task_run",
            run_id = %run_id,
            task_type = %task.task_type,
        );
        set_parent_from_traceparent(&span, current_traceparent().as_deref());

        let events = self.events.clone();
        let id = run_id.clone();
        self.pool.execute(permit, registration, move |cancellation| {
            async move {
                run_ephemeral(id, task, definition, cancellation, events).await;
                drop(request_guard);
            }
            .instrument(span)
        });

        debug!(run_id = %run_id, "ephemeral task admitted");
        Ok(run_id)
    }

    fn reject(&self, task_type: &str, reason: &str) -> TaskManagerError {
        warn!(task_type, reason, "ephemeral task rejected");
        emit(
            &self.events,
            TaskLifecycleEvent::TaskRejected {
                task_type: task_type.to_string(),
                reason: reason.to_string(),
            },
        );
        TaskManagerError::CapacityExceeded(format!("{task_type}: {reason}"))
    }
}

async fn run_ephemeral(
    run_id: String,
    task: EphemeralTask,
    definition: Arc<TaskDefinition>,
    cancellation: CancellationToken,
    events: EventSender,
) {
    emit(
        &events,
        TaskLifecycleEvent::TaskRunStarted {
            task_id: run_id.clone(),
            task_type: task.task_type.clone(),
            ephemeral: true,
        },
    );

    let ctx = RunContext {
        task_id: None,
        task_type: task.task_type.clone(),
        params: task.params,
        state: task.state,
        attempts: task.attempts,
        schedule: None,
        cancellation,
    };

    let started = Instant::now();
    let outcome = match run_with_timeout(Arc::clone(&definition.runner), ctx, definition.timeout).await
    {
        Ok(_) => RunEventOutcome::Succeeded,
        Err(failure) => {
            warn!(error = %failure, "ephemeral task run failed");
            RunEventOutcome::from(&failure)
        }
    };

    emit(
        &events,
        TaskLifecycleEvent::TaskRunCompleted {
            task_id: run_id,
            task_type: task.task_type,
            outcome,
            duration: started.elapsed(),
            ephemeral: true,
        },
    );
}

/// One of `request_capacity` ephemeral run tickets
struct RequestGuard {
    in_flight: Arc<AtomicUsize>,
}

impl RequestGuard {
    fn acquire(in_flight: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()
            .map(|_| Self {
                in_flight: Arc::clone(in_flight),
            })
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{RunResult, TaskDefinitionRegistry};
    use crate::events::event_channel;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn lifecycle(
        config: EphemeralTasksConfig,
        pool: Arc<WorkerPool>,
        gate: Arc<Semaphore>,
    ) -> (EphemeralTaskLifecycle, EventSender) {
        let mut registry = TaskDefinitionRegistry::new();
        registry
            .register(TaskDefinition::new("thumbnail", move |_ctx| {
                let gate = Arc::clone(&gate);
                async move {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    Ok(RunResult::done())
                }
            }))
            .unwrap();
        let events = event_channel();
        let lifecycle = EphemeralTaskLifecycle::new(
            config,
            Arc::new(registry.freeze(3)),
            pool,
            events.clone(),
            CancellationToken::new(),
        );
        (lifecycle, events)
    }

    fn enabled(request_capacity: usize, reserved_headroom: usize) -> EphemeralTasksConfig {
        EphemeralTasksConfig {
            enabled: true,
            request_capacity,
            reserved_headroom,
        }
    }

    #[tokio::test]
    async fn test_disabled_rejects() {
        let (lifecycle, events) = lifecycle(
            EphemeralTasksConfig::default(),
            WorkerPool::new(4),
            Arc::new(Semaphore::new(0)),
        );
        let mut rx = events.subscribe();

        let err = lifecycle
            .attempt_to_run(EphemeralTask::new("thumbnail"))
            .unwrap_err();
        assert!(matches!(err, TaskManagerError::CapacityExceeded(_)));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TaskLifecycleEvent::TaskRejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_is_validation_error() {
        let (lifecycle, _) = lifecycle(enabled(4, 0), WorkerPool::new(4), Arc::new(Semaphore::new(0)));
        let err = lifecycle
            .attempt_to_run(EphemeralTask::new("unknown"))
            .unwrap_err();
        assert!(matches!(err, TaskManagerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_headroom_is_reserved_for_persisted_tasks() {
        let gate = Arc::new(Semaphore::new(0));
        let pool = WorkerPool::new(2);
        let (lifecycle, _) = lifecycle(enabled(10, 1), Arc::clone(&pool), Arc::clone(&gate));

        lifecycle
            .attempt_to_run(EphemeralTask::new("thumbnail"))
            .unwrap();
        assert_eq!(pool.load(), 1);

        // One slot left, and it is the reserved one
        let err = lifecycle
            .attempt_to_run(EphemeralTask::new("thumbnail"))
            .unwrap_err();
        assert!(matches!(err, TaskManagerError::CapacityExceeded(_)));

        gate.add_permits(10);
        assert!(pool.wait_for_idle(Duration::from_secs(1)).await);
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_request_capacity_limits_in_flight_runs() {
        let gate = Arc::new(Semaphore::new(0));
        let pool = WorkerPool::new(10);
        let (lifecycle, _) = lifecycle(enabled(2, 0), Arc::clone(&pool), Arc::clone(&gate));

        lifecycle.attempt_to_run(EphemeralTask::new("thumbnail")).unwrap();
        lifecycle.attempt_to_run(EphemeralTask::new("thumbnail")).unwrap();
        assert_eq!(lifecycle.in_flight(), 2);
        assert!(lifecycle
            .attempt_to_run(EphemeralTask::new("thumbnail"))
            .is_err());

        gate.add_permits(10);
        assert!(pool.wait_for_idle(Duration::from_secs(1)).await);
        assert_eq!(pool.load(), 0);
    }

    #[tokio::test]
    async fn test_run_emits_started_and_completed() {
        let gate = Arc::new(Semaphore::new(0));
        let pool = WorkerPool::new(4);
        let (lifecycle, events) = lifecycle(enabled(4, 0), Arc::clone(&pool), Arc::clone(&gate));
        let mut rx = events.subscribe();

        let run_id = lifecycle
            .attempt_to_run(EphemeralTask::new("thumbnail"))
            .unwrap();
        assert!(run_id.starts_with("ephemeral:"));

        match rx.recv().await.unwrap() {
            TaskLifecycleEvent::TaskRunStarted { task_id, ephemeral, .. } => {
                assert_eq!(task_id, run_id);
                assert!(ephemeral);
            }
            other => panic!("unexpected event {other:?}"),
        }

        gate.add_permits(1);
        match rx.recv().await.unwrap() {
            TaskLifecycleEvent::TaskRunCompleted { outcome, .. } => {
                assert_eq!(outcome, RunEventOutcome::Succeeded);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
