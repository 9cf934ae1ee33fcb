//! Task scheduling API
//!
//! Thin validation over [`TaskStore`]. Every read-modify-write goes through
//! [`retry_on_conflict`], so a poller claiming the same document between our
//! read and our write only costs a re-read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, instrument};

use crate::ephemeral::EphemeralTaskLifecycle;
use crate::error::TaskManagerError;
use crate::persistence::{BulkItemError, BulkResult, TaskStore, UpdateOptions};
use crate::reliability::retry_on_conflict;
use crate::task::{EphemeralTask, Interval, IntervalSchedule, NewTask, TaskInstance, TaskStatus};
use crate::telemetry::current_traceparent;

/// Outcome of a bulk modification
///
/// `tasks` holds the documents that were written; ids that needed no change
/// appear in neither list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkUpdateTaskResult {
    pub tasks: Vec<TaskInstance>,
    pub errors: Vec<BulkItemError>,
}

impl BulkUpdateTaskResult {
    fn collect(results: Vec<BulkResult<Option<TaskInstance>>>) -> Self {
        let mut collected = Self::default();
        for result in results {
            match result {
                Ok(Some(task)) => collected.tasks.push(task),
                Ok(None) => {}
                Err(err) => collected.errors.push(err),
            }
        }
        collected
    }
}

pub struct TaskScheduling {
    store: Arc<TaskStore>,
    ephemeral: Option<Arc<EphemeralTaskLifecycle>>,
    conflict_retries: u32,
}

impl TaskScheduling {
    pub fn new(
        store: Arc<TaskStore>,
        ephemeral: Option<Arc<EphemeralTaskLifecycle>>,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            ephemeral,
            conflict_retries,
        }
    }

    /// Persist a new task instance
    ///
    /// Fails with `Validation` for unregistered types and `Conflict` when the
    /// id is taken.
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    pub async fn schedule(&self, task: NewTask) -> Result<TaskInstance, TaskManagerError> {
        self.store.schedule(self.materialize(task)).await
    }

    pub async fn bulk_schedule(&self, tasks: Vec<NewTask>) -> Vec<BulkResult<TaskInstance>> {
        let instances = tasks.into_iter().map(|task| self.materialize(task)).collect();
        self.store.bulk_schedule(instances).await
    }

    /// Create the task unless a task with its id exists; the existing one is
    /// returned untouched
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    pub async fn ensure_scheduled(&self, task: NewTask) -> Result<TaskInstance, TaskManagerError> {
        let Some(id) = task.id.clone() else {
            return Err(TaskManagerError::Validation(
                "ensure_scheduled requires a task id".into(),
            ));
        };

        match self.store.schedule(self.materialize(task)).await {
            Err(TaskManagerError::Conflict(_)) => {
                debug!(task_id = %id, "task already scheduled");
                self.store.get(&id).await
            }
            other => other,
        }
    }

    /// Make a task due now
    ///
    /// Tasks being run are refused; failed tasks are revived with a fresh
    /// attempt budget.
    #[instrument(skip(self))]
    pub async fn run_soon(&self, id: &str) -> Result<TaskInstance, TaskManagerError> {
        let updated = self
            .modify(id, &|task: &mut TaskInstance, now: DateTime<Utc>| {
                if task.status.is_claimed() {
                    return Err(TaskManagerError::Validation(format!(
                        "task {} is currently running",
                        task.id
                    )));
                }
                if task.status == TaskStatus::Failed {
                    task.status = TaskStatus::Idle;
                    task.attempts = 0;
                }
                task.run_at = now;
                Ok(true)
            })
            .await?;
        updated.ok_or_else(|| TaskManagerError::NotFound(id.to_string()))
    }

    /// Enable tasks, optionally making them due now
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn bulk_enable(&self, ids: &[String], run_soon: bool) -> BulkUpdateTaskResult {
        self.bulk_modify(ids, &|task: &mut TaskInstance, now: DateTime<Utc>| {
            if task.enabled {
                return Ok(false);
            }
            task.enabled = true;
            if run_soon {
                task.run_at = now;
            }
            Ok(true)
        })
        .await
    }

    /// Disable tasks; their documents and history stay in the store
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn bulk_disable(&self, ids: &[String]) -> BulkUpdateTaskResult {
        self.bulk_modify(ids, &|task: &mut TaskInstance, _now: DateTime<Utc>| {
            if !task.enabled {
                return Ok(false);
            }
            task.enabled = false;
            Ok(true)
        })
        .await
    }

    /// Move tasks to a new recurrence interval
    ///
    /// The next run keeps its distance from the previous one:
    /// `run_at - old_interval + new_interval`, never earlier than now. Tasks
    /// already on `interval` and tasks being run are left alone.
    #[instrument(skip(self, ids), fields(count = ids.len(), interval = %interval))]
    pub async fn bulk_update_schedules(
        &self,
        ids: &[String],
        interval: Interval,
    ) -> BulkUpdateTaskResult {
        self.bulk_modify(ids, &|task: &mut TaskInstance, now: DateTime<Utc>| {
            if task.status.is_claimed() {
                return Ok(false);
            }
            let previous = task.schedule.map(|schedule| schedule.interval);
            if previous == Some(interval) {
                return Ok(false);
            }
            task.run_at = rebased_run_at(task.run_at, previous, interval, now);
            task.schedule = Some(IntervalSchedule::every(interval));
            Ok(true)
        })
        .await
    }

    /// Run a task right away without persisting it
    pub fn ephemeral_run_now(&self, task: EphemeralTask) -> Result<String, TaskManagerError> {
        match &self.ephemeral {
            Some(lifecycle) => lifecycle.attempt_to_run(task),
            None => Err(TaskManagerError::CapacityExceeded(
                "ephemeral tasks are not run on this node".into(),
            )),
        }
    }

    pub fn supports_ephemeral_tasks(&self) -> bool {
        self.ephemeral
            .as_ref()
            .is_some_and(|lifecycle| lifecycle.is_enabled())
    }

    fn materialize(&self, mut task: NewTask) -> TaskInstance {
        if task.traceparent.is_none() {
            task.traceparent = current_traceparent();
        }
        task.into_instance(Utc::now())
    }

    async fn bulk_modify<F>(&self, ids: &[String], intent: &F) -> BulkUpdateTaskResult
    where
        F: Fn(&mut TaskInstance, DateTime<Utc>) -> Result<bool, TaskManagerError> + Sync,
    {
        let results = join_all(ids.iter().map(|id| async move {
            self.modify(id, intent).await.map_err(|error| BulkItemError {
                id: id.clone(),
                error,
            })
        }))
        .await;
        BulkUpdateTaskResult::collect(results)
    }

    /// Read, apply `intent`, write back; `None` when `intent` made no change
    async fn modify<F>(&self, id: &str, intent: &F) -> Result<Option<TaskInstance>, TaskManagerError>
    where
        F: Fn(&mut TaskInstance, DateTime<Utc>) -> Result<bool, TaskManagerError> + Sync,
    {
        retry_on_conflict(self.conflict_retries, |_attempt| async move {
            let mut task = self.store.get(id).await?;
            if !intent(&mut task, Utc::now())? {
                return Ok(None);
            }
            // Metadata edits must still work for types this node lacks
            self.store
                .update(task, UpdateOptions::unvalidated())
                .await
                .map(Some)
        })
        .await
    }
}

fn rebased_run_at(
    run_at: DateTime<Utc>,
    previous: Option<Interval>,
    next: Interval,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let base = match previous {
        Some(previous) => run_at - previous.as_chrono(),
        None => run_at,
    };
    (base + next.as_chrono()).max(now)
}
