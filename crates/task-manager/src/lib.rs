//! # Distributed Task Manager
//!
//! Background task scheduling and execution for a cluster of nodes sharing
//! one document store.
//!
//! ## Features
//!
//! - **Optimistic claiming**: nodes take ownership of due tasks with
//!   version-checked writes, there is no lock manager or leader
//! - **Recurring tasks**: fixed intervals, rescheduled from the previous run
//!   without catch-up bursts
//! - **Retries**: per-definition exponential backoff with jitter, then a
//!   terminal `failed` state (or removal)
//! - **Bounded workers**: global capacity plus per-task-type concurrency
//! - **Self-tuning throughput**: store errors shrink the worker count and
//!   stretch the poll interval until the store recovers
//! - **Ephemeral tasks**: run-now work that is never persisted
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TaskScheduling (public API)                 │
//! │  schedule, ensure_scheduled, run_soon, bulk enable/disable  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TaskStore                           │
//! │   (validation, error stream, availability over a backend)   │
//! └─────────────────────────────────────────────────────────────┘
//!              ▲                                   │ errors
//!              │ claim / write back                ▼
//! ┌───────────────────────────────┐   ┌─────────────────────────┐
//! │     TaskPollingLifecycle      │◀──│  ManagedConfiguration   │
//! │  claim due tasks → WorkerPool │   │ (max workers, interval) │
//! └───────────────────────────────┘   └─────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use everruns_task_manager::prelude::*;
//!
//! # async fn run() -> Result<(), TaskManagerError> {
//! let mut manager = TaskManager::setup(TaskManagerConfig::default(), "node-1")?;
//! manager.register_task_definition(
//!     TaskDefinition::new("cleanup", |ctx: RunContext| async move {
//!         tracing::info!(attempt = ctx.attempts, "cleaning up");
//!         Ok(RunResult::done())
//!     })
//!     .with_timeout(Duration::from_secs(60)),
//! )?;
//!
//! let started = manager.start(Arc::new(InMemoryTaskDocumentStore::new()))?;
//! started
//!     .ensure_scheduled(
//!         NewTask::new("cleanup")
//!             .with_id("hourly-cleanup")
//!             .with_schedule(Interval::parse("1h").unwrap()),
//!     )
//!     .await?;
//!
//! started.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod definition;
pub mod ephemeral;
pub mod error;
pub mod events;
pub mod managed_config;
pub mod manager;
pub mod monitoring;
pub mod persistence;
pub mod reliability;
pub mod scheduling;
pub mod task;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{EphemeralTasksConfig, TaskManagerConfig};
    pub use crate::definition::{
        ExhaustedPolicy, RunContext, RunResult, TaskDefinition, TaskRunError, TaskRunner,
    };
    pub use crate::error::TaskManagerError;
    pub use crate::events::TaskLifecycleEvent;
    pub use crate::manager::{TaskManager, TaskManagerStart};
    pub use crate::persistence::{
        InMemoryTaskDocumentStore, PostgresTaskDocumentStore, TaskDocumentStore, TaskQuery,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::task::{
        EphemeralTask, Interval, NewTask, TaskInstance, TaskStatus,
    };
}

// Re-export key types at crate root
pub use config::{EphemeralTasksConfig, MonitoringConfig, TaskManagerConfig};
pub use definition::{
    ExhaustedPolicy, RunContext, RunResult, TaskDefinition, TaskRunError, TaskRunFailure,
    TaskRunner,
};
pub use ephemeral::EphemeralTaskLifecycle;
pub use error::TaskManagerError;
pub use events::{RunEventOutcome, TaskLifecycleEvent};
pub use managed_config::{ManagedConfigurationSettings, Throughput};
pub use manager::{TaskManager, TaskManagerStart};
pub use monitoring::{HealthSnapshot, RuntimeStats};
pub use persistence::{
    AggregationRequest, InMemoryTaskDocumentStore, PostgresTaskDocumentStore, StoreError,
    TaskAggregation, TaskDocumentStore, TaskQuery,
};
pub use reliability::RetryPolicy;
pub use scheduling::{BulkUpdateTaskResult, TaskScheduling};
pub use task::{
    EphemeralTask, Interval, IntervalSchedule, NewTask, TaskInstance, TaskStatus,
};
pub use worker::{PollingState, WorkerPool};
