//! Task lifecycle events
//!
//! Broadcast by the polling and ephemeral lifecycles; monitoring folds them
//! into runtime counters and callers can follow them through
//! `TaskManagerStart::subscribe_events`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::definition::TaskRunFailure;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Outcome of a single run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunEventOutcome {
    Succeeded,
    /// Failed, another attempt is scheduled at `retry_at`
    Retrying {
        error: String,
        retry_at: DateTime<Utc>,
    },
    /// Failed with no attempts left (or a non-retryable error)
    Exhausted { error: String },
    TimedOut { timeout: Duration },
}

impl RunEventOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl From<&TaskRunFailure> for RunEventOutcome {
    fn from(failure: &TaskRunFailure) -> Self {
        match failure {
            TaskRunFailure::RunnerTimeout { timeout } => Self::TimedOut { timeout: *timeout },
            TaskRunFailure::RunnerThrown { message, .. } => Self::Exhausted {
                error: message.clone(),
            },
        }
    }
}

/// Something that happened in a lifecycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskLifecycleEvent {
    /// One poll tick finished
    PollingCycle {
        capacity: usize,
        claimed: usize,
        conflicts: usize,
        unrecognized: usize,
        /// How late the tick started compared to its schedule
        drift: Duration,
    },
    /// The claim query of a tick failed
    PollingError { error: String },
    TaskClaimed { task_id: String, task_type: String },
    TaskRunStarted {
        /// Task id, or the generated run id of an ephemeral run
        task_id: String,
        task_type: String,
        ephemeral: bool,
    },
    TaskRunCompleted {
        task_id: String,
        task_type: String,
        outcome: RunEventOutcome,
        duration: Duration,
        ephemeral: bool,
    },
    /// An ephemeral run was refused at admission
    TaskRejected { task_type: String, reason: String },
}

impl TaskLifecycleEvent {
    pub(crate) fn ephemeral_run_id(run_id: Uuid) -> String {
        format!("ephemeral:{run_id}")
    }
}

pub type EventSender = broadcast::Sender<TaskLifecycleEvent>;

pub fn event_channel() -> EventSender {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// Publish without caring whether anybody listens
pub(crate) fn emit(events: &EventSender, event: TaskLifecycleEvent) {
    let _ = events.send(event);
}
