//! Task runner contract

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::task::IntervalSchedule;

/// Everything a runner gets to see about the run it executes
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Persisted task id (`None` for ephemeral runs)
    pub task_id: Option<String>,
    pub task_type: String,
    pub params: serde_json::Value,
    pub state: serde_json::Value,
    /// Attempt number of this run (1-based)
    pub attempts: u32,
    pub schedule: Option<IntervalSchedule>,
    /// Cancelled when the run times out or the node shuts down
    pub cancellation: CancellationToken,
}

impl RunContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.task_id.is_none()
    }
}

/// Successful outcome of a run
///
/// `state` replaces the persisted state. `run_at` and `schedule` let a runner
/// override when (and whether) the task runs next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub state: Option<serde_json::Value>,
    pub run_at: Option<DateTime<Utc>>,
    pub schedule: Option<IntervalSchedule>,
}

impl RunResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_schedule(mut self, schedule: IntervalSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }
}

/// Error returned by a runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRunError {
    pub message: String,

    /// Non-retryable errors end the task without further attempts
    pub retryable: bool,
}

impl TaskRunError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for TaskRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskRunError {}

impl From<anyhow::Error> for TaskRunError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// Why a run did not succeed, as recorded by the worker pool
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskRunFailure {
    #[error("runner timed out after {timeout:?}")]
    RunnerTimeout { timeout: Duration },

    #[error("runner failed: {message}")]
    RunnerThrown { message: String, retryable: bool },
}

impl TaskRunFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RunnerTimeout { .. } => true,
            Self::RunnerThrown { retryable, .. } => *retryable,
        }
    }
}

impl From<TaskRunError> for TaskRunFailure {
    fn from(err: TaskRunError) -> Self {
        Self::RunnerThrown {
            message: err.message,
            retryable: err.retryable,
        }
    }
}

/// Executes runs of one task type
///
/// Long runners should watch [`RunContext::cancellation`]; a runner that
/// ignores it keeps running after its timeout while the task may already be
/// claimed elsewhere.
///
/// # Example
///
/// ```ignore
/// struct Cleanup;
///
/// #[async_trait]
/// impl TaskRunner for Cleanup {
///     async fn run(&self, ctx: RunContext) -> Result<RunResult, TaskRunError> {
///         purge_expired(&ctx.params).await?;
///         Ok(RunResult::done())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, ctx: RunContext) -> Result<RunResult, TaskRunError>;
}

/// Adapts an async closure into a [`TaskRunner`]
pub struct FnRunner<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnRunner<F, Fut>
where
    F: Fn(RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RunResult, TaskRunError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> TaskRunner for FnRunner<F, Fut>
where
    F: Fn(RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RunResult, TaskRunError>> + Send + 'static,
{
    async fn run(&self, ctx: RunContext) -> Result<RunResult, TaskRunError> {
        (self.f)(ctx).await
    }
}
