//! Claiming: taking ownership of due tasks through conditional writes

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use super::pool::WorkerPool;
use crate::error::TaskManagerError;
use crate::persistence::{matches_type_pattern, TaskQuery, TaskStore, UpdateOptions};
use crate::task::{TaskInstance, TaskStatus};

/// Result of one claim round
#[derive(Debug, Clone, Default)]
pub struct ClaimOwnershipResult {
    /// Claimed documents (status `running`, owned by this node), `run_at` ascending
    pub claimed: Vec<TaskInstance>,
    /// Candidates another writer got to first
    pub conflicts: usize,
    /// Due tasks of removed types marked `unrecognized`
    pub unrecognized: usize,
    /// Claim writes that failed for other reasons
    pub errors: usize,
}

pub struct TaskClaiming {
    store: Arc<TaskStore>,
    exclude_task_types: Vec<String>,
    removed_task_types: Vec<String>,
    max_batch_size: usize,
}

impl TaskClaiming {
    pub fn new(
        store: Arc<TaskStore>,
        exclude_task_types: Vec<String>,
        removed_task_types: Vec<String>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            store,
            exclude_task_types,
            removed_task_types,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Registered task types this node may claim
    pub fn claimable_types(&self) -> Vec<String> {
        self.store
            .definitions()
            .types()
            .into_iter()
            .filter(|task_type| {
                !self
                    .exclude_task_types
                    .iter()
                    .any(|pattern| matches_type_pattern(task_type, pattern))
            })
            .collect()
    }

    /// Claim up to `capacity` due tasks, respecting per-type limits in `pool`
    ///
    /// Only the candidate query can fail the round; individual claim writes
    /// that fail are counted and skipped.
    #[instrument(skip(self, pool), fields(task_manager_id = %self.store.task_manager_id()))]
    pub async fn claim_available_tasks(
        &self,
        capacity: usize,
        pool: &WorkerPool,
    ) -> Result<ClaimOwnershipResult, TaskManagerError> {
        let now = Utc::now();
        let mut result = ClaimOwnershipResult {
            unrecognized: self.mark_removed_types_unrecognized(now).await,
            ..Default::default()
        };

        let capacity = capacity.min(self.max_batch_size);
        if capacity == 0 {
            return Ok(result);
        }

        // Remaining per-type budget on this node, for types with a limit
        let definitions = self.store.definitions();
        let mut budgets: HashMap<String, usize> = HashMap::new();
        let mut types = Vec::new();
        for task_type in self.claimable_types() {
            let Some(definition) = definitions.get(&task_type) else {
                continue;
            };
            if let Some(limit) = definition.max_concurrency {
                let remaining = limit.saturating_sub(pool.type_load(&task_type));
                if remaining == 0 {
                    continue;
                }
                budgets.insert(task_type.clone(), remaining);
            }
            types.push(task_type);
        }
        if types.is_empty() {
            return Ok(result);
        }

        let query = TaskQuery::claimable(now)
            .with_task_types(types)
            .with_limit(capacity);
        let candidates = self.store.fetch(&query).await?.docs;

        let mut claims = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(remaining) = budgets.get_mut(&candidate.task_type) {
                if *remaining == 0 {
                    continue;
                }
                *remaining -= 1;
            }
            let Some(definition) = definitions.get(&candidate.task_type) else {
                continue;
            };
            claims.push(self.claim_document(candidate, definition.timeout, now));
        }

        for outcome in join_all(claims.into_iter().map(|doc| {
            let store = Arc::clone(&self.store);
            async move { store.update(doc, UpdateOptions::unvalidated()).await }
        }))
        .await
        {
            match outcome {
                Ok(doc) => result.claimed.push(doc),
                Err(err) if err.is_version_conflict() || err.is_not_found() => {
                    result.conflicts += 1;
                }
                Err(err) => {
                    warn!(error = %err, "failed to claim task");
                    result.errors += 1;
                }
            }
        }

        debug!(
            claimed = result.claimed.len(),
            conflicts = result.conflicts,
            "claim round finished"
        );
        Ok(result)
    }

    fn claim_document(
        &self,
        mut doc: TaskInstance,
        timeout: std::time::Duration,
        now: DateTime<Utc>,
    ) -> TaskInstance {
        doc.status = TaskStatus::Running;
        doc.owner_id = Some(self.store.task_manager_id().to_string());
        doc.started_at = Some(now);
        doc.retry_at = Some(
            now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::hours(1)),
        );
        doc.attempts = doc.attempts.saturating_add(1);
        doc
    }

    /// Mark due tasks of retired types so nobody tries to run them again
    async fn mark_removed_types_unrecognized(&self, now: DateTime<Utc>) -> usize {
        if self.removed_task_types.is_empty() {
            return 0;
        }

        let query = TaskQuery::claimable(now)
            .with_task_types(self.removed_task_types.clone())
            .with_limit(self.max_batch_size);
        let docs = match self.store.fetch(&query).await {
            Ok(fetched) => fetched.docs,
            Err(err) => {
                warn!(error = %err, "failed to look up tasks of removed types");
                return 0;
            }
        };

        let updates = docs
            .into_iter()
            .map(|mut doc| {
                doc.release();
                doc.status = TaskStatus::Unrecognized;
                doc
            })
            .collect();

        let marked = self
            .store
            .bulk_update(updates, UpdateOptions::unvalidated())
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count();
        if marked > 0 {
            warn!(count = marked, "marked tasks of removed types as unrecognized");
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{RunResult, TaskDefinition, TaskDefinitionRegistry};
    use crate::persistence::{InMemoryTaskDocumentStore, TaskDocumentStore};
    use crate::task::NewTask;

    fn store_with(definitions: Vec<TaskDefinition>) -> (Arc<InMemoryTaskDocumentStore>, Arc<TaskStore>) {
        let mut registry = TaskDefinitionRegistry::new();
        registry.register_all(definitions).unwrap();
        let backend = Arc::new(InMemoryTaskDocumentStore::new());
        let store = Arc::new(TaskStore::new(
            backend.clone(),
            Arc::new(registry.freeze(3)),
            "node-1",
        ));
        (backend, store)
    }

    fn noop(task_type: &str) -> TaskDefinition {
        TaskDefinition::new(task_type, |_ctx| async { Ok(RunResult::done()) })
    }

    async fn seed(backend: &InMemoryTaskDocumentStore, id: &str, task_type: &str, age_secs: i64) {
        let now = Utc::now();
        backend
            .create(
                NewTask::new(task_type)
                    .with_id(id)
                    .with_run_at(now - chrono::Duration::seconds(age_secs))
                    .into_instance(now),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_claims_oldest_first_up_to_capacity() {
        let (backend, store) = store_with(vec![noop("report")]);
        seed(&backend, "new", "report", 1).await;
        seed(&backend, "old", "report", 30).await;
        seed(&backend, "mid", "report", 10).await;

        let claiming = TaskClaiming::new(store, vec![], vec![], 10);
        let pool = WorkerPool::new(10);
        let result = claiming.claim_available_tasks(2, &pool).await.unwrap();

        let ids: Vec<_> = result.claimed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "mid"]);
        for task in &result.claimed {
            assert_eq!(task.status, TaskStatus::Running);
            assert_eq!(task.owner_id.as_deref(), Some("node-1"));
            assert_eq!(task.attempts, 1);
            assert!(task.retry_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_respects_type_budget_and_exclusions() {
        let (backend, store) = store_with(vec![
            noop("report").with_max_concurrency(1),
            noop("legacy:sync"),
        ]);
        seed(&backend, "r1", "report", 3).await;
        seed(&backend, "r2", "report", 2).await;
        seed(&backend, "l1", "legacy:sync", 1).await;

        let claiming = TaskClaiming::new(store, vec!["legacy:*".into()], vec![], 10);
        let pool = WorkerPool::new(10);
        let result = claiming.claim_available_tasks(10, &pool).await.unwrap();

        let ids: Vec<_> = result.claimed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["r1"]);
    }

    #[tokio::test]
    async fn test_marks_removed_types() {
        let (backend, store) = store_with(vec![noop("report")]);
        seed(&backend, "gone", "retired_type", 5).await;

        let claiming = TaskClaiming::new(store, vec![], vec!["retired_type".into()], 10);
        let pool = WorkerPool::new(10);
        let result = claiming.claim_available_tasks(10, &pool).await.unwrap();

        assert_eq!(result.unrecognized, 1);
        assert!(result.claimed.is_empty());
        let doc = backend.read("gone").await.unwrap();
        assert_eq!(doc.status, TaskStatus::Unrecognized);
    }

    #[tokio::test]
    async fn test_zero_capacity_queries_nothing() {
        let (backend, store) = store_with(vec![noop("report")]);
        seed(&backend, "a", "report", 5).await;
        backend.set_available(false);

        let claiming = TaskClaiming::new(store, vec![], vec![], 10);
        let pool = WorkerPool::new(1);
        let result = claiming.claim_available_tasks(0, &pool).await.unwrap();
        assert!(result.claimed.is_empty());
    }
}
