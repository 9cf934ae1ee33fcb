//! TaskDocumentStore trait definition

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{TaskInstance, TaskStatus};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed
    #[error("version conflict on task {id}: expected {expected}, got {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },

    /// Backend unreachable (connection refused, pool exhausted)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Errors that are part of normal operation and say nothing about
    /// store health
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::AlreadyExists(_) | Self::VersionConflict { .. }
        )
    }

    /// Failures that mean the store is overloaded or unreachable, the only
    /// ones throughput is reduced for
    pub fn signals_overload(&self) -> bool {
        self.is_unavailable()
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Sort order of query results (ties broken by id)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSort {
    #[default]
    RunAtAsc,
    RunAtDesc,
    ScheduledAtAsc,
}

/// Filter over task documents
///
/// Every set field narrows the result. `exclude_task_types` entries may end
/// with `*` to exclude a whole prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub ids: Option<Vec<String>>,
    pub task_types: Option<Vec<String>>,
    pub exclude_task_types: Vec<String>,
    pub statuses: Option<Vec<TaskStatus>>,
    /// `run_at <= run_at_before`
    pub run_at_before: Option<DateTime<Utc>>,
    /// `run_at >= run_at_after`
    pub run_at_after: Option<DateTime<Utc>>,
    pub enabled: Option<bool>,
    pub owner_id: Option<String>,
    /// Only tasks a poller may claim at this instant
    pub claimable_at: Option<DateTime<Utc>>,
    pub sort: TaskSort,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks claimable at `now`, oldest `run_at` first
    pub fn claimable(now: DateTime<Utc>) -> Self {
        Self {
            claimable_at: Some(now),
            sort: TaskSort::RunAtAsc,
            ..Self::default()
        }
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_task_types(
        mut self,
        task_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.task_types = Some(task_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn excluding_task_types(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.exclude_task_types
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn with_run_at_before(mut self, at: DateTime<Utc>) -> Self {
        self.run_at_before = Some(at);
        self
    }

    pub fn with_run_at_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_at_after = Some(at);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_sort(mut self, sort: TaskSort) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether a single document passes the filter (ignores sort/paging)
    pub fn matches(&self, task: &TaskInstance) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &task.id) {
                return false;
            }
        }
        if let Some(types) = &self.task_types {
            if !types.iter().any(|t| t == &task.task_type) {
                return false;
            }
        }
        if self
            .exclude_task_types
            .iter()
            .any(|pattern| matches_type_pattern(&task.task_type, pattern))
        {
            return false;
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(before) = self.run_at_before {
            if task.run_at > before {
                return false;
            }
        }
        if let Some(after) = self.run_at_after {
            if task.run_at < after {
                return false;
            }
        }
        if let Some(enabled) = self.enabled {
            if task.enabled != enabled {
                return false;
            }
        }
        if let Some(owner) = &self.owner_id {
            if task.owner_id.as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        if let Some(now) = self.claimable_at {
            if !task.is_claimable_at(now) {
                return false;
            }
        }
        true
    }

    /// Sort and page an already filtered result set
    pub fn sort_and_page(&self, mut docs: Vec<TaskInstance>) -> Vec<TaskInstance> {
        match self.sort {
            TaskSort::RunAtAsc => docs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id))),
            TaskSort::RunAtDesc => {
                docs.sort_by(|a, b| b.run_at.cmp(&a.run_at).then(a.id.cmp(&b.id)))
            }
            TaskSort::ScheduledAtAsc => docs.sort_by(|a, b| {
                a.scheduled_at
                    .cmp(&b.scheduled_at)
                    .then(a.id.cmp(&b.id))
            }),
        }
        docs.into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Match a task type against an exact name or a `prefix*` pattern
pub fn matches_type_pattern(task_type: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => task_type.starts_with(prefix),
        None => task_type == pattern,
    }
}

/// Result page of a fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub docs: Vec<TaskInstance>,
}

/// Request for workload counters
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationRequest {
    pub query: TaskQuery,
    /// Idle enabled tasks with `run_at` before this instant count as overdue
    pub overdue_at: DateTime<Utc>,
}

impl AggregationRequest {
    pub fn all(now: DateTime<Utc>) -> Self {
        Self {
            query: TaskQuery::default(),
            overdue_at: now,
        }
    }
}

/// Workload counters over the task documents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAggregation {
    pub total: u64,
    pub by_status: BTreeMap<TaskStatus, u64>,
    pub by_task_type: BTreeMap<String, u64>,
    pub overdue: u64,
}

impl TaskAggregation {
    pub fn from_docs<'a>(
        docs: impl IntoIterator<Item = &'a TaskInstance>,
        overdue_at: DateTime<Utc>,
    ) -> Self {
        let mut aggregation = Self::default();
        for doc in docs {
            aggregation.total += 1;
            *aggregation.by_status.entry(doc.status).or_default() += 1;
            *aggregation
                .by_task_type
                .entry(doc.task_type.clone())
                .or_default() += 1;
            if doc.status == TaskStatus::Idle && doc.enabled && doc.run_at < overdue_at {
                aggregation.overdue += 1;
            }
        }
        aggregation
    }

    pub fn count(&self, status: TaskStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Persistent document store with conditional-write semantics
///
/// Every successful write bumps the document's `version`. Implementations
/// must make `conditional_write` atomic: the write applies only if the stored
/// version equals the version carried by the written document.
#[async_trait]
pub trait TaskDocumentStore: Send + Sync + 'static {
    /// Insert a new document (`AlreadyExists` if the id is taken)
    async fn create(&self, doc: TaskInstance) -> Result<TaskInstance, StoreError>;

    async fn read(&self, id: &str) -> Result<TaskInstance, StoreError>;

    /// Replace a document if its stored version equals `doc.version`
    ///
    /// Returns the stored document with its new version.
    async fn conditional_write(&self, doc: TaskInstance) -> Result<TaskInstance, StoreError>;

    /// Conditional write of several documents, one result per input
    async fn bulk_conditional_write(
        &self,
        docs: Vec<TaskInstance>,
    ) -> Vec<Result<TaskInstance, StoreError>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            results.push(self.conditional_write(doc).await);
        }
        results
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Delete a document only if its stored version equals `version`
    ///
    /// The default reads and then deletes, which is not atomic. Backends
    /// shared between nodes override it.
    async fn conditional_delete(&self, id: &str, version: u64) -> Result<(), StoreError> {
        let current = self.read(id).await?;
        if current.version != version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: version,
                actual: current.version,
            });
        }
        self.delete(id).await
    }

    async fn bulk_delete(&self, ids: &[String]) -> Vec<Result<(), StoreError>> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.delete(id).await);
        }
        results
    }

    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskInstance>, StoreError>;

    async fn aggregate(&self, request: &AggregationRequest) -> Result<TaskAggregation, StoreError> {
        let mut query = request.query.clone();
        query.limit = None;
        query.offset = 0;
        let docs = self.query(&query).await?;
        Ok(TaskAggregation::from_docs(&docs, request.overdue_at))
    }

    /// Cheap reachability check used by the health probe
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NewTask;
    use chrono::Duration;

    #[test]
    fn test_error_classification() {
        assert!(StoreError::AlreadyExists("a".into()).is_expected());
        assert!(StoreError::NotFound("a".into()).is_expected());
        assert!(!StoreError::Database("boom".into()).is_expected());

        assert!(StoreError::Unavailable("down".into()).signals_overload());
        assert!(!StoreError::Database("boom".into()).signals_overload());
        assert!(!StoreError::AlreadyExists("a".into()).signals_overload());
    }

    #[test]
    fn test_type_patterns() {
        assert!(matches_type_pattern("report", "report"));
        assert!(!matches_type_pattern("report_daily", "report"));
        assert!(matches_type_pattern("report_daily", "report*"));
        assert!(matches_type_pattern("anything", "*"));
    }

    #[test]
    fn test_query_filters() {
        let now = Utc::now();
        let due = NewTask::new("alerting:rule")
            .with_id("a")
            .into_instance(now - Duration::seconds(5));
        let future = NewTask::new("report")
            .with_id("b")
            .with_run_at(now + Duration::hours(1))
            .into_instance(now);

        let claimable = TaskQuery::claimable(now);
        assert!(claimable.matches(&due));
        assert!(!claimable.matches(&future));

        let excluded = TaskQuery::new().excluding_task_types(["alerting:*"]);
        assert!(!excluded.matches(&due));
        assert!(excluded.matches(&future));

        let by_type = TaskQuery::new().with_task_types(["report"]);
        assert!(by_type.matches(&future));
        assert!(!by_type.matches(&due));
    }

    #[test]
    fn test_sort_and_page() {
        let now = Utc::now();
        let docs: Vec<_> = (0..5)
            .map(|i| {
                NewTask::new("t")
                    .with_id(format!("task-{i}"))
                    .with_run_at(now - Duration::seconds(i))
                    .into_instance(now)
            })
            .collect();

        let page = TaskQuery::new().with_offset(1).with_limit(2).sort_and_page(docs);
        let ids: Vec<_> = page.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["task-3", "task-2"]);
    }

    #[test]
    fn test_aggregation() {
        let now = Utc::now();
        let overdue = NewTask::new("a").into_instance(now - Duration::minutes(1));
        let mut failed = NewTask::new("b").into_instance(now - Duration::minutes(1));
        failed.status = TaskStatus::Failed;
        let upcoming = NewTask::new("a")
            .with_run_at(now + Duration::minutes(1))
            .into_instance(now);

        let aggregation = TaskAggregation::from_docs([&overdue, &failed, &upcoming], now);
        assert_eq!(aggregation.total, 3);
        assert_eq!(aggregation.count(TaskStatus::Idle), 2);
        assert_eq!(aggregation.count(TaskStatus::Failed), 1);
        assert_eq!(aggregation.by_task_type["a"], 2);
        assert_eq!(aggregation.overdue, 1);
    }
}
