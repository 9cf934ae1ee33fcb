//! Task Store: the node's single gateway to task documents
//!
//! Wraps a [`TaskDocumentStore`] backend with task-type validation, error
//! reporting (the `errors` stream feeding managed configuration) and the
//! store availability signal that gates polling.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::store::{
    AggregationRequest, FetchResult, StoreError, TaskAggregation, TaskDocumentStore, TaskQuery,
};
use crate::definition::TaskTypeDictionary;
use crate::error::TaskManagerError;
use crate::task::TaskInstance;

const ERROR_CHANNEL_CAPACITY: usize = 256;

/// A failed store operation, as seen by subscribers of [`TaskStore::errors`]
#[derive(Debug, Clone)]
pub struct StoreErrorEvent {
    pub operation: &'static str,
    pub error: StoreError,
    pub at: DateTime<Utc>,
}

/// Per-item failure of a bulk operation
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemError {
    pub id: String,
    pub error: TaskManagerError,
}

pub type BulkResult<T> = Result<T, BulkItemError>;

/// Options for [`TaskStore::update`]
#[derive(Debug, Clone, Copy)]
pub struct UpdateOptions {
    /// Reject documents whose task type is not registered
    pub validate: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self { validate: true }
    }
}

impl UpdateOptions {
    /// Skip type validation (internal writes of claimed tasks)
    pub fn unvalidated() -> Self {
        Self { validate: false }
    }
}

pub struct TaskStore {
    backend: Arc<dyn TaskDocumentStore>,
    definitions: Arc<TaskTypeDictionary>,
    task_manager_id: String,
    errors: broadcast::Sender<StoreErrorEvent>,
    availability: watch::Sender<bool>,
}

impl TaskStore {
    pub fn new(
        backend: Arc<dyn TaskDocumentStore>,
        definitions: Arc<TaskTypeDictionary>,
        task_manager_id: impl Into<String>,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let (availability, _) = watch::channel(true);
        Self {
            backend,
            definitions,
            task_manager_id: task_manager_id.into(),
            errors,
            availability,
        }
    }

    pub fn task_manager_id(&self) -> &str {
        &self.task_manager_id
    }

    pub fn definitions(&self) -> &Arc<TaskTypeDictionary> {
        &self.definitions
    }

    /// Stream of unexpected store failures
    pub fn errors(&self) -> broadcast::Receiver<StoreErrorEvent> {
        self.errors.subscribe()
    }

    /// Store availability signal (`false` while the backend is unreachable)
    pub fn availability(&self) -> watch::Receiver<bool> {
        self.availability.subscribe()
    }

    pub fn is_available(&self) -> bool {
        *self.availability.borrow()
    }

    /// Create a task document
    #[instrument(skip(self, instance), fields(task_id = %instance.id, task_type = %instance.task_type))]
    pub async fn schedule(&self, instance: TaskInstance) -> Result<TaskInstance, TaskManagerError> {
        self.definitions.ensure_registered(&instance.task_type)?;
        let result = self.backend.create(instance).await;
        self.track("schedule", result)
    }

    pub async fn bulk_schedule(&self, instances: Vec<TaskInstance>) -> Vec<BulkResult<TaskInstance>> {
        join_all(instances.into_iter().map(|instance| async move {
            let id = instance.id.clone();
            self.schedule(instance)
                .await
                .map_err(|error| BulkItemError { id, error })
        }))
        .await
    }

    #[instrument(skip(self, query))]
    pub async fn fetch(&self, query: &TaskQuery) -> Result<FetchResult, TaskManagerError> {
        let result = self.backend.query(query).await;
        let docs = self.track("fetch", result)?;
        Ok(FetchResult { docs })
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<TaskInstance, TaskManagerError> {
        let result = self.backend.read(id).await;
        self.track("get", result)
    }

    /// Conditional write of a full document against its `version`
    #[instrument(skip(self, instance, options), fields(task_id = %instance.id, version = instance.version))]
    pub async fn update(
        &self,
        instance: TaskInstance,
        options: UpdateOptions,
    ) -> Result<TaskInstance, TaskManagerError> {
        if options.validate {
            self.definitions.ensure_registered(&instance.task_type)?;
        }
        let result = self.backend.conditional_write(instance).await;
        self.track("update", result)
    }

    pub async fn bulk_update(
        &self,
        instances: Vec<TaskInstance>,
        options: UpdateOptions,
    ) -> Vec<BulkResult<TaskInstance>> {
        let mut results: Vec<Option<BulkResult<TaskInstance>>> = vec![None; instances.len()];
        let mut writable = Vec::with_capacity(instances.len());
        let mut positions = Vec::with_capacity(instances.len());

        for (position, instance) in instances.into_iter().enumerate() {
            if options.validate {
                if let Err(err) = self.definitions.ensure_registered(&instance.task_type) {
                    results[position] = Some(Err(BulkItemError {
                        id: instance.id,
                        error: err.into(),
                    }));
                    continue;
                }
            }
            positions.push(position);
            writable.push(instance);
        }

        let ids: Vec<String> = writable.iter().map(|i| i.id.clone()).collect();
        let written = self.backend.bulk_conditional_write(writable).await;
        for ((position, id), result) in positions.into_iter().zip(ids).zip(written) {
            results[position] = Some(
                self.track("bulk_update", result)
                    .map_err(|error| BulkItemError { id, error }),
            );
        }

        results.into_iter().flatten().collect()
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<(), TaskManagerError> {
        let result = self.backend.delete(id).await;
        self.track("remove", result)
    }

    /// Remove a task only if it is still at `version`
    #[instrument(skip(self))]
    pub async fn remove_unchanged(&self, id: &str, version: u64) -> Result<(), TaskManagerError> {
        let result = self.backend.conditional_delete(id, version).await;
        self.track("remove", result)
    }

    /// Remove a task, treating a missing document as success
    pub async fn remove_if_exists(&self, id: &str) -> Result<(), TaskManagerError> {
        match self.remove(id).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    pub async fn bulk_remove(&self, ids: &[String]) -> Vec<BulkResult<String>> {
        let results = self.backend.bulk_delete(ids).await;
        ids.iter()
            .cloned()
            .zip(results)
            .map(|(id, result)| {
                self.track("bulk_remove", result)
                    .map(|_| id.clone())
                    .map_err(|error| BulkItemError { id, error })
            })
            .collect()
    }

    #[instrument(skip(self, request))]
    pub async fn aggregate(
        &self,
        request: &AggregationRequest,
    ) -> Result<TaskAggregation, TaskManagerError> {
        let result = self.backend.aggregate(request).await;
        self.track("aggregate", result)
    }

    /// Periodically ping the backend and publish availability changes
    pub fn spawn_health_probe(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match store.backend.ping().await {
                    Ok(()) => store.set_available(true),
                    Err(err) => {
                        if store.is_available() {
                            warn!(error = %err, "task store health check failed");
                        }
                        store.set_available(false);
                    }
                }
            }
        })
    }

    fn set_available(&self, available: bool) {
        let changed = self.availability.send_if_modified(|current| {
            let changed = *current != available;
            *current = available;
            changed
        });
        if changed {
            if available {
                info!("task store is available again");
            } else {
                warn!("task store became unavailable, pausing polling");
            }
        }
    }

    /// Report unexpected failures and convert to the API error type
    fn track<T>(
        &self,
        operation: &'static str,
        result: Result<T, StoreError>,
    ) -> Result<T, TaskManagerError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if !err.is_expected() {
                    warn!(operation, error = %err, "task store operation failed");
                    if err.is_unavailable() {
                        self.set_available(false);
                    }
                    // Nobody listening is fine
                    let _ = self.errors.send(StoreErrorEvent {
                        operation,
                        error: err.clone(),
                        at: Utc::now(),
                    });
                }
                Err(err.into())
            }
        }
    }
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("task_manager_id", &self.task_manager_id)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}
