//! Ephemeral task admission through a running node
//!
//! Run with: cargo test -p everruns-task-manager --test ephemeral_test

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use everruns_task_manager::prelude::*;
use everruns_task_manager::RunEventOutcome;

use common::*;

/// Definition whose runs block until the gate hands out a permit
fn gated(task_type: &str, gate: Arc<Semaphore>) -> TaskDefinition {
    TaskDefinition::new(task_type, move |_ctx: RunContext| {
        let gate = Arc::clone(&gate);
        async move {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            Ok(RunResult::done())
        }
    })
}

fn ephemeral_config(max_workers: usize, reserved_headroom: usize) -> TaskManagerConfig {
    fast_config()
        .with_max_workers(max_workers)
        .with_ephemeral_tasks(EphemeralTasksConfig {
            enabled: true,
            request_capacity: 10,
            reserved_headroom,
        })
}

#[tokio::test]
async fn test_ephemeral_run_emits_outcome() {
    init_test_logging();
    let backend = Arc::new(InMemoryTaskDocumentStore::new());
    let gate = Arc::new(Semaphore::new(1));
    let node = start_node(
        &backend,
        "node-1",
        ephemeral_config(4, 1),
        vec![gated("thumbnail", Arc::clone(&gate))],
    );
    assert!(node.supports_ephemeral_tasks());
    let mut events = node.subscribe_events();

    let run_id = node
        .ephemeral_run_now(EphemeralTask::new("thumbnail"))
        .unwrap();

    assert_eq!(
        next_completion(&mut events, &run_id).await,
        Some(RunEventOutcome::Succeeded)
    );
    // Nothing was persisted
    assert_eq!(backend.task_count(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_ephemeral_rejected_at_full_capacity() {
    init_test_logging();
    let backend = Arc::new(InMemoryTaskDocumentStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let node = start_node(
        &backend,
        "node-1",
        ephemeral_config(2, 1),
        vec![gated("thumbnail", Arc::clone(&gate))],
    );
    let mut events = node.subscribe_events();

    node.ephemeral_run_now(EphemeralTask::new("thumbnail"))
        .unwrap();

    // The last free slot is reserved for persisted tasks
    let err = node
        .ephemeral_run_now(EphemeralTask::new("thumbnail"))
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::CapacityExceeded(_)));
    assert!(next_event(&mut events, Duration::from_secs(1), |event| matches!(
        event,
        TaskLifecycleEvent::TaskRejected { task_type, .. } if task_type == "thumbnail"
    ))
    .await
    .is_some());

    gate.add_permits(10);
    assert!(wait_until(Duration::from_secs(2), || node.in_flight().is_empty()).await);

    // Capacity is back
    assert!(node
        .ephemeral_run_now(EphemeralTask::new("thumbnail"))
        .is_ok());

    node.shutdown().await;
}

#[tokio::test]
async fn test_ephemeral_disabled_by_default() {
    init_test_logging();
    let backend = Arc::new(InMemoryTaskDocumentStore::new());
    let node = start_node(
        &backend,
        "node-1",
        fast_config(),
        vec![gated("thumbnail", Arc::new(Semaphore::new(10)))],
    );

    assert!(!node.supports_ephemeral_tasks());
    let err = node
        .ephemeral_run_now(EphemeralTask::new("thumbnail"))
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::CapacityExceeded(_)));

    node.shutdown().await;
}

#[tokio::test]
async fn test_ephemeral_runs_count_against_type_concurrency() {
    init_test_logging();
    let backend = Arc::new(InMemoryTaskDocumentStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let node = start_node(
        &backend,
        "node-1",
        ephemeral_config(10, 0),
        vec![gated("thumbnail", Arc::clone(&gate)).with_max_concurrency(1)],
    );

    node.ephemeral_run_now(EphemeralTask::new("thumbnail"))
        .unwrap();
    let err = node
        .ephemeral_run_now(EphemeralTask::new("thumbnail"))
        .unwrap_err();
    assert!(matches!(err, TaskManagerError::CapacityExceeded(_)));

    gate.add_permits(10);
    node.shutdown().await;
}
