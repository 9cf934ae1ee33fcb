//! Task instance data model
//!
//! A [`TaskInstance`] is the persisted document the whole cluster coordinates
//! on. Its `version` is the optimistic-concurrency token: the store bumps it on
//! every successful write and rejects writes carrying a stale one.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task status in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `run_at`
    Idle,
    /// Ownership being taken by a node
    Claiming,
    /// Executing on the owning node
    Running,
    /// Exhausted its attempts (terminal)
    Failed,
    /// Task type was removed from the cluster, never claimed again
    Unrecognized,
}

impl TaskStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [TaskStatus; 5] = [
        Self::Idle,
        Self::Claiming,
        Self::Running,
        Self::Failed,
        Self::Unrecognized,
    ];

    /// Status owned by a node (claiming or running)
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claiming | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "claiming" => Ok(Self::Claiming),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "unrecognized" => Ok(Self::Unrecognized),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Error parsing an interval string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid interval {input:?}: {reason}")]
pub struct IntervalError {
    pub input: String,
    pub reason: &'static str,
}

/// Recurrence interval written as `<n>s`, `<n>m`, `<n>h` or `<n>d`
///
/// # Example
///
/// ```
/// use everruns_task_manager::Interval;
/// use std::time::Duration;
///
/// let interval: Interval = "5m".parse().unwrap();
/// assert_eq!(interval.as_duration(), Duration::from_secs(300));
/// assert_eq!(interval.to_string(), "5m");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval(Duration);

impl Interval {
    /// Parse an interval string
    pub fn parse(input: &str) -> Result<Self, IntervalError> {
        let err = |reason| IntervalError {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        if trimmed.len() < 2 {
            return Err(err("expected a number followed by s, m, h or d"));
        }

        let (digits, unit) = trimmed.split_at(trimmed.len() - 1);
        let value: u64 = digits.parse().map_err(|_| err("not a whole number"))?;
        let multiplier = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            _ => return Err(err("unit must be one of s, m, h, d")),
        };

        if value == 0 {
            return Err(err("interval must be greater than zero"));
        }

        let secs = value
            .checked_mul(multiplier)
            .ok_or_else(|| err("interval is too large"))?;
        Ok(Self(Duration::from_secs(secs)))
    }

    /// Build from whole seconds (zero is rejected)
    pub fn from_secs(secs: u64) -> Result<Self, IntervalError> {
        if secs == 0 {
            return Err(IntervalError {
                input: "0s".to_string(),
                reason: "interval must be greater than zero",
            });
        }
        Ok(Self(Duration::from_secs(secs)))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.0.as_secs() as i64)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs % 86_400 == 0 {
            write!(f, "{}d", secs / 86_400)
        } else if secs % 3_600 == 0 {
            write!(f, "{}h", secs / 3_600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl FromStr for Interval {
    type Err = IntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Interval {
    type Error = IntervalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.to_string()
    }
}

/// Recurrence schedule of a task instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSchedule {
    pub interval: Interval,
}

impl IntervalSchedule {
    pub fn every(interval: Interval) -> Self {
        Self { interval }
    }
}

/// A persisted unit of schedulable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: String,
    pub task_type: String,
    pub params: serde_json::Value,
    pub state: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Deadline of the current claim; past it the task may be reclaimed
    pub retry_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub owner_id: Option<String>,
    pub status: TaskStatus,
    pub schedule: Option<IntervalSchedule>,
    pub traceparent: Option<String>,
    pub enabled: bool,
    /// Optimistic-concurrency token, bumped by the store on every write
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl TaskInstance {
    pub fn is_recurring(&self) -> bool {
        self.schedule.is_some()
    }

    /// Whether a poller may claim this task at `now`
    ///
    /// Idle tasks are claimable once due. Claimed tasks become claimable again
    /// once their claim deadline passed, which is how work held by a crashed
    /// node is recovered.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.status {
            TaskStatus::Idle => self.run_at <= now,
            TaskStatus::Claiming | TaskStatus::Running => {
                self.retry_at.map(|at| at <= now).unwrap_or(false)
            }
            TaskStatus::Failed | TaskStatus::Unrecognized => false,
        }
    }

    /// Release ownership fields, leaving the task idle
    pub(crate) fn release(&mut self) {
        self.status = TaskStatus::Idle;
        self.owner_id = None;
        self.started_at = None;
        self.retry_at = None;
    }
}

/// Request to schedule a new task instance
///
/// # Example
///
/// ```
/// use everruns_task_manager::{Interval, NewTask};
/// use serde_json::json;
///
/// let task = NewTask::new("report")
///     .with_id("daily-report")
///     .with_params(json!({"recipients": ["ops"]}))
///     .with_schedule("1d".parse::<Interval>().unwrap());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: Option<String>,
    pub task_type: String,
    pub params: serde_json::Value,
    pub state: serde_json::Value,
    pub run_at: Option<DateTime<Utc>>,
    pub schedule: Option<IntervalSchedule>,
    pub enabled: bool,
    pub traceparent: Option<String>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            params: serde_json::json!({}),
            state: serde_json::json!({}),
            run_at: None,
            schedule: None,
            enabled: true,
            traceparent: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_schedule(mut self, interval: Interval) -> Self {
        self.schedule = Some(IntervalSchedule::every(interval));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_traceparent(mut self, traceparent: impl Into<String>) -> Self {
        self.traceparent = Some(traceparent.into());
        self
    }

    /// Materialize the persisted document (version 0, assigned by the store)
    pub fn into_instance(self, now: DateTime<Utc>) -> TaskInstance {
        TaskInstance {
            id: self.id.unwrap_or_else(|| Uuid::now_v7().to_string()),
            task_type: self.task_type,
            params: self.params,
            state: self.state,
            scheduled_at: now,
            run_at: self.run_at.unwrap_or(now),
            started_at: None,
            retry_at: None,
            attempts: 0,
            owner_id: None,
            status: TaskStatus::Idle,
            schedule: self.schedule,
            traceparent: self.traceparent,
            enabled: self.enabled,
            version: 0,
            updated_at: now,
        }
    }
}

/// In-memory, run-once-immediately unit of work (lost on crash)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralTask {
    pub task_type: String,
    pub params: serde_json::Value,
    pub state: serde_json::Value,
    pub attempts: u32,
}

impl EphemeralTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            params: serde_json::json!({}),
            state: serde_json::json!({}),
            attempts: 0,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }
}
