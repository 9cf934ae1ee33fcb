//! Managed configuration under a stream of store errors
//!
//! Run with: cargo test -p everruns-task-manager --test managed_configuration_test

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use everruns_task_manager::managed_config::{
    create_managed_configuration, ManagedConfigurationSettings, Throughput,
};
use everruns_task_manager::persistence::StoreErrorEvent;
use everruns_task_manager::prelude::*;
use everruns_task_manager::{MonitoringConfig, StoreError};

use common::{counting, fast_config, init_test_logging, wait_until};

fn starting() -> Throughput {
    Throughput {
        max_workers: 10,
        poll_interval: Duration::from_secs(3),
    }
}

fn store_error() -> StoreErrorEvent {
    StoreErrorEvent {
        operation: "fetch",
        error: StoreError::Unavailable("connection refused".into()),
        at: Utc::now(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_backs_off_under_errors_and_recovers() {
    init_test_logging();
    let (errors_tx, errors_rx) = broadcast::channel(64);
    let shutdown = CancellationToken::new();
    let settings = ManagedConfigurationSettings::default();
    let managed =
        create_managed_configuration(errors_rx, starting(), settings.clone(), shutdown.clone());
    let mut max_workers = managed.max_workers.clone();
    let poll_interval = managed.poll_interval.clone();

    // Let the controller task subscribe before errors arrive
    tokio::task::yield_now().await;
    for _ in 0..5 {
        errors_tx.send(store_error()).unwrap();
    }

    tokio::time::sleep(settings.adjust_interval + Duration::from_millis(1)).await;
    max_workers.changed().await.unwrap();
    assert_eq!(*max_workers.borrow(), 8);
    assert_eq!(*poll_interval.borrow(), Duration::from_millis(3600));

    // Errors age out of the window, then throughput creeps back
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(*max_workers.borrow(), 10);
    assert_eq!(*poll_interval.borrow(), Duration::from_secs(3));

    shutdown.cancel();
    managed.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_quiet_store_keeps_starting_throughput() {
    init_test_logging();
    let (_errors_tx, errors_rx) = broadcast::channel::<StoreErrorEvent>(64);
    let shutdown = CancellationToken::new();
    let managed = create_managed_configuration(
        errors_rx,
        starting(),
        ManagedConfigurationSettings::default(),
        shutdown.clone(),
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(*managed.max_workers.borrow(), 10);
    assert_eq!(*managed.poll_interval.borrow(), Duration::from_secs(3));

    shutdown.cancel();
    managed.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_non_overload_errors_leave_throughput_alone() {
    init_test_logging();
    let (errors_tx, errors_rx) = broadcast::channel(64);
    let shutdown = CancellationToken::new();
    let settings = ManagedConfigurationSettings::default();
    let managed =
        create_managed_configuration(errors_rx, starting(), settings.clone(), shutdown.clone());

    tokio::task::yield_now().await;
    for _ in 0..5 {
        errors_tx
            .send(StoreErrorEvent {
                operation: "bulk_update",
                error: StoreError::Database("constraint violated".into()),
                at: Utc::now(),
            })
            .unwrap();
    }

    tokio::time::sleep(settings.adjust_interval * 3).await;
    assert_eq!(*managed.max_workers.borrow(), 10);
    assert_eq!(*managed.poll_interval.borrow(), Duration::from_secs(3));

    shutdown.cancel();
    managed.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sustained_errors_hit_the_floor() {
    init_test_logging();
    let (errors_tx, errors_rx) = broadcast::channel(1024);
    let shutdown = CancellationToken::new();
    let settings = ManagedConfigurationSettings::default();
    let managed =
        create_managed_configuration(errors_rx, starting(), settings.clone(), shutdown.clone());

    for _ in 0..50 {
        errors_tx.send(store_error()).unwrap();
        tokio::time::sleep(settings.adjust_interval).await;
    }

    assert_eq!(*managed.max_workers.borrow(), settings.min_workers);
    assert!(*managed.poll_interval.borrow() <= settings.max_poll_interval);
    assert!(*managed.poll_interval.borrow() > starting().poll_interval);

    shutdown.cancel();
    managed.handle.await.unwrap();
}

/// Store whose point reads fail as unreachable while `reads_failing` is set
struct OverloadedStore {
    inner: InMemoryTaskDocumentStore,
    reads_failing: AtomicBool,
}

impl OverloadedStore {
    fn new() -> Self {
        Self {
            inner: InMemoryTaskDocumentStore::new(),
            reads_failing: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TaskDocumentStore for OverloadedStore {
    async fn create(&self, doc: TaskInstance) -> Result<TaskInstance, StoreError> {
        self.inner.create(doc).await
    }

    async fn read(&self, id: &str) -> Result<TaskInstance, StoreError> {
        if self.reads_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("too many requests".into()));
        }
        self.inner.read(id).await
    }

    async fn conditional_write(&self, doc: TaskInstance) -> Result<TaskInstance, StoreError> {
        self.inner.conditional_write(doc).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskInstance>, StoreError> {
        self.inner.query(query).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

fn managed_node(backend: Arc<dyn TaskDocumentStore>) -> TaskManagerStart {
    let config = fast_config()
        .with_max_workers(10)
        .with_poll_interval(POLL_INTERVAL)
        .with_managed_configuration(ManagedConfigurationSettings {
            adjust_interval: Duration::from_millis(50),
            error_window: Duration::from_millis(100),
            recover_fraction: 0.5,
            max_poll_interval: Duration::from_millis(200),
            ..Default::default()
        })
        .with_monitoring(MonitoringConfig {
            refresh_interval: Duration::from_millis(20),
            ..Default::default()
        });

    let mut manager = TaskManager::setup(config, "node-1").unwrap();
    manager
        .register_task_definition(counting("heartbeat", Arc::new(AtomicUsize::new(0))))
        .unwrap();
    manager.start(backend).unwrap()
}

#[tokio::test]
async fn test_node_backs_off_while_store_is_overloaded() {
    init_test_logging();
    let backend = Arc::new(OverloadedStore::new());
    let node = managed_node(backend.clone());

    backend.reads_failing.store(true, Ordering::SeqCst);
    let mut shrunk = false;
    for _ in 0..100 {
        assert!(node.get("missing").await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        if node.worker_capacity() < 10 && node.health().configuration.max_workers < 10 {
            shrunk = true;
            break;
        }
    }
    assert!(shrunk, "throughput never dropped under store errors");

    backend.reads_failing.store(false, Ordering::SeqCst);
    let recovered = wait_until(Duration::from_secs(5), || {
        let configuration = node.health().configuration;
        node.worker_capacity() == 10
            && configuration.max_workers == 10
            && configuration.poll_interval == POLL_INTERVAL
    })
    .await;
    assert!(recovered, "throughput did not recover");

    node.shutdown().await;
}

#[tokio::test]
async fn test_repeated_ensure_scheduled_keeps_throughput() {
    init_test_logging();
    let backend = Arc::new(InMemoryTaskDocumentStore::new());
    let node = managed_node(backend.clone());

    for _ in 0..3 {
        let task = node
            .ensure_scheduled(
                NewTask::new("heartbeat")
                    .with_id("singleton")
                    .with_run_at(Utc::now() + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        assert_eq!(task.id, "singleton");
    }

    // Several adjustment rounds
    tokio::time::sleep(Duration::from_millis(300)).await;

    let configuration = node.health().configuration;
    assert_eq!(node.worker_capacity(), 10);
    assert_eq!(configuration.max_workers, 10);
    assert_eq!(configuration.poll_interval, POLL_INTERVAL);
    assert!(configuration.store_available);
    assert_eq!(backend.task_count(), 1);

    node.shutdown().await;
}
