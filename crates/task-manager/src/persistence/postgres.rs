//! PostgreSQL implementation of TaskDocumentStore
//!
//! One row per task document in `task_manager_tasks`. Conditional writes are
//! a single `UPDATE ... WHERE id = $1 AND version = $n`, so the version check
//! and the write are atomic without explicit locking.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::task::{Interval, IntervalSchedule, TaskInstance, TaskStatus};

const COLUMNS: &str = "id, task_type, params, state, scheduled_at, run_at, started_at, \
     retry_at, attempts, owner_id, status, schedule_interval, traceparent, enabled, version, \
     updated_at";

/// PostgreSQL implementation of TaskDocumentStore
///
/// # Example
///
/// ```ignore
/// use everruns_task_manager::PostgresTaskDocumentStore;
///
/// let store = PostgresTaskDocumentStore::connect("postgres://localhost/tasks", 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskDocumentStore {
    pool: PgPool,
}

impl PostgresTaskDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("failed to connect to PostgreSQL", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run task manager migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn current_version(&self, id: &str) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT version FROM task_manager_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to read task version", e))?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64))
    }
}

#[async_trait]
impl TaskDocumentStore for PostgresTaskDocumentStore {
    #[instrument(skip(self, doc), fields(task_id = %doc.id, task_type = %doc.task_type))]
    async fn create(&self, doc: TaskInstance) -> Result<TaskInstance, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO task_manager_tasks (
                id, task_type, params, state, scheduled_at, run_at, started_at, retry_at,
                attempts, owner_id, status, schedule_interval, traceparent, enabled, version,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 1, NOW())
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&doc.id)
            .bind(&doc.task_type)
            .bind(&doc.params)
            .bind(&doc.state)
            .bind(doc.scheduled_at)
            .bind(doc.run_at)
            .bind(doc.started_at)
            .bind(doc.retry_at)
            .bind(doc.attempts as i32)
            .bind(&doc.owner_id)
            .bind(doc.status.as_str())
            .bind(doc.schedule.map(|s| s.interval.to_string()))
            .bind(&doc.traceparent)
            .bind(doc.enabled)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::AlreadyExists(doc.id.clone())
                } else {
                    map_sqlx_error("failed to create task", e)
                }
            })?;

        debug!("created task");
        row_to_task(&row)
    }

    #[instrument(skip(self))]
    async fn read(&self, id: &str) -> Result<TaskInstance, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM task_manager_tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to read task", e))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row_to_task(&row)
    }

    #[instrument(skip(self, doc), fields(task_id = %doc.id, version = doc.version))]
    async fn conditional_write(&self, doc: TaskInstance) -> Result<TaskInstance, StoreError> {
        let sql = format!(
            r#"
            UPDATE task_manager_tasks
            SET task_type = $2,
                params = $3,
                state = $4,
                scheduled_at = $5,
                run_at = $6,
                started_at = $7,
                retry_at = $8,
                attempts = $9,
                owner_id = $10,
                status = $11,
                schedule_interval = $12,
                traceparent = $13,
                enabled = $14,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $15
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&doc.id)
            .bind(&doc.task_type)
            .bind(&doc.params)
            .bind(&doc.state)
            .bind(doc.scheduled_at)
            .bind(doc.run_at)
            .bind(doc.started_at)
            .bind(doc.retry_at)
            .bind(doc.attempts as i32)
            .bind(&doc.owner_id)
            .bind(doc.status.as_str())
            .bind(doc.schedule.map(|s| s.interval.to_string()))
            .bind(&doc.traceparent)
            .bind(doc.enabled)
            .bind(doc.version as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to write task", e))?;

        match row {
            Some(row) => row_to_task(&row),
            // Zero rows: either the document is gone or someone else wrote first
            None => match self.current_version(&doc.id).await? {
                Some(actual) => Err(StoreError::VersionConflict {
                    id: doc.id,
                    expected: doc.version,
                    actual,
                }),
                None => Err(StoreError::NotFound(doc.id)),
            },
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM task_manager_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to delete task", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn conditional_delete(&self, id: &str, version: u64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM task_manager_tasks WHERE id = $1 AND version = $2")
            .bind(id)
            .bind(version as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to delete task", e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.current_version(id).await? {
            Some(actual) => Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: version,
                actual,
            }),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn bulk_delete(&self, ids: &[String]) -> Vec<Result<(), StoreError>> {
        let deleted = sqlx::query("DELETE FROM task_manager_tasks WHERE id = ANY($1) RETURNING id")
            .bind(ids)
            .fetch_all(&self.pool)
            .await;

        match deleted {
            Ok(rows) => {
                let deleted: std::collections::HashSet<String> =
                    rows.iter().map(|r| r.get::<String, _>("id")).collect();
                ids.iter()
                    .map(|id| {
                        if deleted.contains(id) {
                            Ok(())
                        } else {
                            Err(StoreError::NotFound(id.clone()))
                        }
                    })
                    .collect()
            }
            Err(e) => {
                let err = map_sqlx_error("failed to bulk delete tasks", e);
                ids.iter().map(|_| Err(err.clone())).collect()
            }
        }
    }

    #[instrument(skip(self, query), fields(limit = ?query.limit))]
    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskInstance>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {COLUMNS} FROM task_manager_tasks WHERE TRUE"
        ));
        push_filters(&mut builder, query);

        builder.push(match query.sort {
            TaskSort::RunAtAsc => " ORDER BY run_at ASC, id ASC",
            TaskSort::RunAtDesc => " ORDER BY run_at DESC, id ASC",
            TaskSort::ScheduledAtAsc => " ORDER BY scheduled_at ASC, id ASC",
        });
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        if query.offset > 0 {
            builder.push(" OFFSET ").push_bind(query.offset as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to query tasks", e))?;

        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self, request))]
    async fn aggregate(&self, request: &AggregationRequest) -> Result<TaskAggregation, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT status, task_type, COUNT(*) AS count, \
             COUNT(*) FILTER (WHERE status = 'idle' AND enabled AND run_at < ",
        );
        builder
            .push_bind(request.overdue_at)
            .push(") AS overdue FROM task_manager_tasks WHERE TRUE");
        push_filters(&mut builder, &request.query);
        builder.push(" GROUP BY status, task_type");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("failed to aggregate tasks", e))?;

        let mut aggregation = TaskAggregation::default();
        for row in rows {
            let status: String = row.get("status");
            let status: TaskStatus = status.parse().map_err(StoreError::Serialization)?;
            let task_type: String = row.get("task_type");
            let count = row.get::<i64, _>("count") as u64;

            aggregation.total += count;
            *aggregation.by_status.entry(status).or_default() += count;
            *aggregation.by_task_type.entry(task_type).or_default() += count;
            aggregation.overdue += row.get::<i64, _>("overdue") as u64;
        }
        Ok(aggregation)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| map_sqlx_error("store health check failed", e))
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &TaskQuery) {
    if let Some(ids) = &query.ids {
        builder.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
    }
    if let Some(types) = &query.task_types {
        builder
            .push(" AND task_type = ANY(")
            .push_bind(types.clone())
            .push(")");
    }
    for pattern in &query.exclude_task_types {
        match pattern.strip_suffix('*') {
            Some(prefix) => {
                builder
                    .push(" AND task_type NOT LIKE ")
                    .push_bind(format!("{}%", escape_like(prefix)));
            }
            None => {
                builder.push(" AND task_type <> ").push_bind(pattern.clone());
            }
        }
    }
    if let Some(statuses) = &query.statuses {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        builder
            .push(" AND status = ANY(")
            .push_bind(statuses)
            .push(")");
    }
    if let Some(before) = query.run_at_before {
        builder.push(" AND run_at <= ").push_bind(before);
    }
    if let Some(after) = query.run_at_after {
        builder.push(" AND run_at >= ").push_bind(after);
    }
    if let Some(enabled) = query.enabled {
        builder.push(" AND enabled = ").push_bind(enabled);
    }
    if let Some(owner) = &query.owner_id {
        builder.push(" AND owner_id = ").push_bind(owner.clone());
    }
    if let Some(now) = query.claimable_at {
        builder
            .push(" AND enabled AND ((status = 'idle' AND run_at <= ")
            .push_bind(now)
            .push(") OR (status IN ('claiming', 'running') AND retry_at <= ")
            .push_bind(now)
            .push("))");
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn row_to_task(row: &PgRow) -> Result<TaskInstance, StoreError> {
    let column_err = |e: sqlx::Error| StoreError::Serialization(e.to_string());

    let status: String = row.try_get("status").map_err(column_err)?;
    let interval: Option<String> = row.try_get("schedule_interval").map_err(column_err)?;
    let schedule = interval
        .map(|raw| {
            Interval::parse(&raw)
                .map(IntervalSchedule::every)
                .map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()?;

    Ok(TaskInstance {
        id: row.try_get("id").map_err(column_err)?,
        task_type: row.try_get("task_type").map_err(column_err)?,
        params: row.try_get("params").map_err(column_err)?,
        state: row.try_get("state").map_err(column_err)?,
        scheduled_at: row.try_get("scheduled_at").map_err(column_err)?,
        run_at: row.try_get("run_at").map_err(column_err)?,
        started_at: row
            .try_get::<Option<DateTime<Utc>>, _>("started_at")
            .map_err(column_err)?,
        retry_at: row
            .try_get::<Option<DateTime<Utc>>, _>("retry_at")
            .map_err(column_err)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(column_err)?.max(0) as u32,
        owner_id: row.try_get("owner_id").map_err(column_err)?,
        status: status.parse().map_err(StoreError::Serialization)?,
        schedule,
        traceparent: row.try_get("traceparent").map_err(column_err)?,
        enabled: row.try_get("enabled").map_err(column_err)?,
        version: row.try_get::<i64, _>("version").map_err(column_err)?.max(0) as u64,
        updated_at: row.try_get("updated_at").map_err(column_err)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Classify a driver error; connectivity failures become `Unavailable`
fn map_sqlx_error(context: &str, err: sqlx::Error) -> StoreError {
    error!(error = %err, "{}", context);
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        other => StoreError::Database(other.to_string()),
    }
}
