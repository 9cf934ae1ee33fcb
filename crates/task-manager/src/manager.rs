//! Task manager node: setup, start and shutdown
//!
//! ```ignore
//! let mut manager = TaskManager::setup(config, "node-1")?;
//! manager.register_task_definitions([cleanup, report])?;
//! let started = manager.start(store)?;
//! started.schedule(NewTask::new("report")).await?;
//! // ...
//! started.shutdown().await;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TaskManagerConfig;
use crate::definition::{TaskDefinition, TaskDefinitionRegistry, TaskTypeDictionary};
use crate::ephemeral::EphemeralTaskLifecycle;
use crate::error::TaskManagerError;
use crate::events::{event_channel, EventSender, TaskLifecycleEvent};
use crate::managed_config::{create_managed_configuration, Throughput};
use crate::monitoring::{create_monitoring_stats, HealthSnapshot, MonitoringSources};
use crate::persistence::{
    AggregationRequest, BulkResult, FetchResult, TaskAggregation, TaskDocumentStore, TaskQuery,
    TaskStore,
};
use crate::scheduling::{BulkUpdateTaskResult, TaskScheduling};
use crate::task::{EphemeralTask, Interval, NewTask, TaskInstance};
use crate::worker::{PollingState, TaskClaiming, TaskPollingLifecycle, WorkerPool, WorkerSlotInfo};

/// Task manager during setup: collects task definitions
pub struct TaskManager {
    config: TaskManagerConfig,
    node_id: String,
    registry: TaskDefinitionRegistry,
}

impl TaskManager {
    pub fn setup(
        config: TaskManagerConfig,
        node_id: impl Into<String>,
    ) -> Result<Self, TaskManagerError> {
        let node_id = node_id.into();
        if node_id.trim().is_empty() {
            return Err(TaskManagerError::Validation(
                "task manager node id must not be empty".into(),
            ));
        }
        config.validate()?;

        Ok(Self {
            config,
            node_id,
            registry: TaskDefinitionRegistry::new(),
        })
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    pub fn register_task_definition(
        &mut self,
        definition: TaskDefinition,
    ) -> Result<(), TaskManagerError> {
        Ok(self.registry.register(definition)?)
    }

    pub fn register_task_definitions(
        &mut self,
        definitions: impl IntoIterator<Item = TaskDefinition>,
    ) -> Result<(), TaskManagerError> {
        Ok(self.registry.register_all(definitions)?)
    }

    /// Freeze the registry and start the node's lifecycles
    ///
    /// Nodes with `run_background_tasks = false` only serve the scheduling
    /// API: no polling and no ephemeral runs.
    pub fn start(
        self,
        backend: Arc<dyn TaskDocumentStore>,
    ) -> Result<TaskManagerStart, TaskManagerError> {
        let Self {
            config,
            node_id,
            registry,
        } = self;

        let definitions: Arc<TaskTypeDictionary> = Arc::new(registry.freeze(config.max_attempts));
        if !config.exclude_task_types.is_empty() {
            warn!(
                excluded = ?config.exclude_task_types,
                "task types excluded from this node will not be run here"
            );
        }

        let store = Arc::new(TaskStore::new(
            backend,
            Arc::clone(&definitions),
            node_id.clone(),
        ));
        let shutdown = CancellationToken::new();
        let events = event_channel();
        let mut handles = Vec::new();

        handles.push(store.spawn_health_probe(config.health_probe_interval, shutdown.clone()));

        let managed = create_managed_configuration(
            store.errors(),
            Throughput {
                max_workers: config.max_workers,
                poll_interval: config.poll_interval,
            },
            config.managed_configuration.clone(),
            shutdown.clone(),
        );
        handles.push(managed.handle);

        let monitoring = create_monitoring_stats(
            MonitoringSources {
                store: Arc::clone(&store),
                events: events.subscribe(),
                max_workers: managed.max_workers.clone(),
                poll_interval: managed.poll_interval.clone(),
            },
            config.monitoring.clone(),
            config.run_background_tasks,
            shutdown.clone(),
        );
        handles.push(monitoring.handle);

        let pool = WorkerPool::new(config.max_workers);
        let (polling, ephemeral) = if config.run_background_tasks {
            let claiming = TaskClaiming::new(
                Arc::clone(&store),
                config.exclude_task_types.clone(),
                config.removed_task_types.clone(),
                config.max_batch_size,
            );
            let polling = TaskPollingLifecycle::new(
                Arc::clone(&store),
                Arc::clone(&pool),
                claiming,
                events.clone(),
                managed.poll_interval,
                managed.max_workers,
                shutdown.child_token(),
                config.shutdown_timeout,
            );
            polling.start()?;

            let ephemeral = Arc::new(EphemeralTaskLifecycle::new(
                config.ephemeral_tasks.clone(),
                Arc::clone(&definitions),
                Arc::clone(&pool),
                events.clone(),
                shutdown.clone(),
            ));
            (Some(polling), Some(ephemeral))
        } else {
            info!("background tasks disabled, this node only schedules tasks");
            (None, None)
        };

        let scheduling = TaskScheduling::new(
            Arc::clone(&store),
            ephemeral,
            config.version_conflict_retries,
        );

        info!(
            node_id = %node_id,
            task_types = definitions.len(),
            run_background_tasks = config.run_background_tasks,
            "task manager started"
        );

        Ok(TaskManagerStart {
            node_id,
            config,
            store,
            scheduling,
            pool,
            polling,
            events,
            health: monitoring.health,
            shutdown,
            handles: Mutex::new(handles),
        })
    }
}

/// Running task manager node
pub struct TaskManagerStart {
    node_id: String,
    config: TaskManagerConfig,
    store: Arc<TaskStore>,
    scheduling: TaskScheduling,
    pool: Arc<WorkerPool>,
    polling: Option<Arc<TaskPollingLifecycle>>,
    events: EventSender,
    health: watch::Receiver<HealthSnapshot>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManagerStart {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    pub async fn fetch(&self, query: &TaskQuery) -> Result<FetchResult, TaskManagerError> {
        self.store.fetch(query).await
    }

    pub async fn aggregate(
        &self,
        request: &AggregationRequest,
    ) -> Result<TaskAggregation, TaskManagerError> {
        self.store.aggregate(request).await
    }

    pub async fn get(&self, id: &str) -> Result<TaskInstance, TaskManagerError> {
        self.store.get(id).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), TaskManagerError> {
        self.store.remove(id).await
    }

    pub async fn remove_if_exists(&self, id: &str) -> Result<(), TaskManagerError> {
        self.store.remove_if_exists(id).await
    }

    pub async fn bulk_remove(&self, ids: &[String]) -> Vec<BulkResult<String>> {
        self.store.bulk_remove(ids).await
    }

    pub async fn schedule(&self, task: NewTask) -> Result<TaskInstance, TaskManagerError> {
        self.scheduling.schedule(task).await
    }

    pub async fn bulk_schedule(&self, tasks: Vec<NewTask>) -> Vec<BulkResult<TaskInstance>> {
        self.scheduling.bulk_schedule(tasks).await
    }

    pub async fn ensure_scheduled(&self, task: NewTask) -> Result<TaskInstance, TaskManagerError> {
        self.scheduling.ensure_scheduled(task).await
    }

    pub async fn run_soon(&self, id: &str) -> Result<TaskInstance, TaskManagerError> {
        self.scheduling.run_soon(id).await
    }

    pub async fn bulk_enable(&self, ids: &[String], run_soon: bool) -> BulkUpdateTaskResult {
        self.scheduling.bulk_enable(ids, run_soon).await
    }

    pub async fn bulk_disable(&self, ids: &[String]) -> BulkUpdateTaskResult {
        self.scheduling.bulk_disable(ids).await
    }

    pub async fn bulk_update_schedules(
        &self,
        ids: &[String],
        interval: Interval,
    ) -> BulkUpdateTaskResult {
        self.scheduling.bulk_update_schedules(ids, interval).await
    }

    pub fn ephemeral_run_now(&self, task: EphemeralTask) -> Result<String, TaskManagerError> {
        self.scheduling.ephemeral_run_now(task)
    }

    pub fn supports_ephemeral_tasks(&self) -> bool {
        self.scheduling.supports_ephemeral_tasks()
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.store.definitions().types()
    }

    /// Latest health snapshot
    pub fn health(&self) -> HealthSnapshot {
        self.health.borrow().clone()
    }

    pub fn health_updates(&self) -> watch::Receiver<HealthSnapshot> {
        self.health.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskLifecycleEvent> {
        self.events.subscribe()
    }

    /// `None` on nodes that do not run background tasks
    pub fn polling_state(&self) -> Option<PollingState> {
        self.polling.as_ref().map(|polling| polling.current_state())
    }

    /// Runs currently executing on this node
    pub fn in_flight(&self) -> Vec<WorkerSlotInfo> {
        self.pool.in_flight()
    }

    /// Worker slots the pool currently admits, as set by managed configuration
    pub fn worker_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Stop polling, drain in-flight runs and tear down background loops
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if let Some(polling) = &self.polling {
            polling.stop().await;
        } else if !self.pool.wait_for_idle(self.config.shutdown_timeout).await {
            self.pool.cancel_all();
        }

        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background loop ended abnormally");
            }
        }
        info!(node_id = %self.node_id, "task manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::RunResult;
    use crate::persistence::InMemoryTaskDocumentStore;
    use std::time::Duration;

    fn noop(task_type: &str) -> TaskDefinition {
        TaskDefinition::new(task_type, |_ctx| async { Ok(RunResult::done()) })
    }

    #[test]
    fn test_empty_node_id_is_rejected() {
        let err = TaskManager::setup(TaskManagerConfig::default(), "  ")
            .err()
            .unwrap();
        assert!(matches!(err, TaskManagerError::Validation(_)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TaskManagerConfig::default().with_max_workers(0);
        assert!(TaskManager::setup(config, "node-1").is_err());
    }

    #[test]
    fn test_duplicate_definition_is_rejected() {
        let mut manager = TaskManager::setup(TaskManagerConfig::default(), "node-1").unwrap();
        manager.register_task_definition(noop("report")).unwrap();
        let err = manager.register_task_definition(noop("report")).unwrap_err();
        assert!(matches!(err, TaskManagerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_schedule_only_node() {
        let config = TaskManagerConfig::default().with_run_background_tasks(false);
        let mut manager = TaskManager::setup(config, "api-1").unwrap();
        manager
            .register_task_definitions([noop("report"), noop("cleanup")])
            .unwrap();

        let started = manager
            .start(Arc::new(InMemoryTaskDocumentStore::new()))
            .unwrap();
        assert_eq!(started.registered_types(), vec!["cleanup", "report"]);
        assert_eq!(started.polling_state(), None);
        assert!(!started.supports_ephemeral_tasks());

        let task = started
            .schedule(NewTask::new("report").with_id("r1"))
            .await
            .unwrap();
        assert_eq!(started.get("r1").await.unwrap(), task);

        // Nobody polls, the task stays put
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.get("r1").await.is_ok());

        started.shutdown().await;
    }
}
