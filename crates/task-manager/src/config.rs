//! Task manager node configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TaskManagerError;
use crate::managed_config::ManagedConfigurationSettings;

/// Ephemeral (run-now, non-persisted) task settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralTasksConfig {
    pub enabled: bool,

    /// Max ephemeral runs in flight on this node
    pub request_capacity: usize,

    /// Worker slots kept free for persisted tasks
    pub reserved_headroom: usize,
}

impl Default for EphemeralTasksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            request_capacity: 10,
            reserved_headroom: 1,
        }
    }
}

/// Health snapshot settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// How often the workload aggregation is refreshed
    #[serde(with = "duration_millis")]
    pub refresh_interval: Duration,

    /// How often the snapshot is logged (background nodes only)
    #[serde(with = "duration_millis")]
    pub log_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            log_interval: Duration::from_secs(60),
        }
    }
}

/// Task manager configuration
///
/// # Example
///
/// ```
/// use everruns_task_manager::TaskManagerConfig;
/// use std::time::Duration;
///
/// let config = TaskManagerConfig::default()
///     .with_max_workers(20)
///     .with_poll_interval(Duration::from_secs(1))
///     .with_exclude_task_types(["reports:*"]);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskManagerConfig {
    /// Worker slots on this node (starting value, tuned at runtime)
    pub max_workers: usize,

    /// Delay between poll cycles (starting value, tuned at runtime)
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Attempts for definitions that do not set their own limit
    pub max_attempts: u32,

    /// Upper bound on tasks claimed per poll cycle
    pub max_batch_size: usize,

    /// Read-modify-write attempts of the scheduling API on version conflicts
    pub version_conflict_retries: u32,

    /// Whether this node polls and runs tasks, or only schedules them
    pub run_background_tasks: bool,

    /// Task types never claimed by this node (`prefix*` allowed)
    pub exclude_task_types: Vec<String>,

    /// Task types retired from the cluster, marked `unrecognized` when due
    pub removed_task_types: Vec<String>,

    pub ephemeral_tasks: EphemeralTasksConfig,

    pub managed_configuration: ManagedConfigurationSettings,

    pub monitoring: MonitoringConfig,

    /// How long shutdown waits for in-flight runs
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Interval of the store ping while tracking availability
    #[serde(with = "duration_millis")]
    pub health_probe_interval: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            poll_interval: Duration::from_secs(3),
            max_attempts: 3,
            max_batch_size: 10,
            version_conflict_retries: 3,
            run_background_tasks: true,
            exclude_task_types: vec![],
            removed_task_types: vec![],
            ephemeral_tasks: EphemeralTasksConfig::default(),
            managed_configuration: ManagedConfigurationSettings::default(),
            monitoring: MonitoringConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            health_probe_interval: Duration::from_secs(5),
        }
    }
}

impl TaskManagerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASK_MANAGER_MAX_WORKERS`
    /// - `TASK_MANAGER_POLL_INTERVAL_MS`
    /// - `TASK_MANAGER_MAX_ATTEMPTS`
    /// - `TASK_MANAGER_MAX_BATCH_SIZE`
    /// - `TASK_MANAGER_RUN_BACKGROUND_TASKS` (`true`/`false`)
    /// - `TASK_MANAGER_EXCLUDE_TASK_TYPES` (comma separated)
    /// - `TASK_MANAGER_REMOVED_TASK_TYPES` (comma separated)
    /// - `TASK_MANAGER_EPHEMERAL_TASKS_ENABLED` (`true`/`false`)
    /// - `TASK_MANAGER_EPHEMERAL_REQUEST_CAPACITY`
    /// - `TASK_MANAGER_SHUTDOWN_TIMEOUT_MS`
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_workers: env_parse("TASK_MANAGER_MAX_WORKERS").unwrap_or(defaults.max_workers),
            poll_interval: env_parse("TASK_MANAGER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            max_attempts: env_parse("TASK_MANAGER_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            max_batch_size: env_parse("TASK_MANAGER_MAX_BATCH_SIZE")
                .unwrap_or(defaults.max_batch_size),
            run_background_tasks: env_parse("TASK_MANAGER_RUN_BACKGROUND_TASKS")
                .unwrap_or(defaults.run_background_tasks),
            exclude_task_types: env_list("TASK_MANAGER_EXCLUDE_TASK_TYPES"),
            removed_task_types: env_list("TASK_MANAGER_REMOVED_TASK_TYPES"),
            ephemeral_tasks: EphemeralTasksConfig {
                enabled: env_parse("TASK_MANAGER_EPHEMERAL_TASKS_ENABLED")
                    .unwrap_or(defaults.ephemeral_tasks.enabled),
                request_capacity: env_parse("TASK_MANAGER_EPHEMERAL_REQUEST_CAPACITY")
                    .unwrap_or(defaults.ephemeral_tasks.request_capacity),
                ..defaults.ephemeral_tasks
            },
            shutdown_timeout: env_parse("TASK_MANAGER_SHUTDOWN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
            ..defaults
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_version_conflict_retries(mut self, retries: u32) -> Self {
        self.version_conflict_retries = retries;
        self
    }

    pub fn with_run_background_tasks(mut self, run: bool) -> Self {
        self.run_background_tasks = run;
        self
    }

    pub fn with_exclude_task_types(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.exclude_task_types = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_removed_task_types(
        mut self,
        task_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.removed_task_types = task_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ephemeral_tasks(mut self, ephemeral_tasks: EphemeralTasksConfig) -> Self {
        self.ephemeral_tasks = ephemeral_tasks;
        self
    }

    pub fn with_managed_configuration(mut self, settings: ManagedConfigurationSettings) -> Self {
        self.managed_configuration = settings;
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_health_probe_interval(mut self, interval: Duration) -> Self {
        self.health_probe_interval = interval;
        self
    }

    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<(), TaskManagerError> {
        let invalid = |msg: &str| Err(TaskManagerError::Validation(msg.to_string()));

        if self.max_workers == 0 {
            return invalid("max_workers must be at least 1");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval must be greater than zero");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.max_batch_size == 0 {
            return invalid("max_batch_size must be at least 1");
        }
        if self.health_probe_interval.is_zero() {
            return invalid("health_probe_interval must be greater than zero");
        }
        if self.ephemeral_tasks.enabled && self.ephemeral_tasks.request_capacity == 0 {
            return invalid("ephemeral_tasks.request_capacity must be at least 1");
        }
        if self.monitoring.refresh_interval.is_zero() || self.monitoring.log_interval.is_zero() {
            return invalid("monitoring intervals must be greater than zero");
        }
        self.managed_configuration
            .validate()
            .map_err(TaskManagerError::Validation)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TaskManagerConfig::default();
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.max_attempts, 3);
        assert!(config.run_background_tasks);
        assert!(!config.ephemeral_tasks.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(TaskManagerConfig::default()
            .with_max_workers(0)
            .validate()
            .is_err());
        assert!(TaskManagerConfig::default()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(TaskManagerConfig::default()
            .with_ephemeral_tasks(EphemeralTasksConfig {
                enabled: true,
                request_capacity: 0,
                reserved_headroom: 0,
            })
            .validate()
            .is_err());
    }

    #[test]
    fn test_serde_durations_in_millis() {
        let config = TaskManagerConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_interval"], 3000);
        assert_eq!(json["shutdown_timeout"], 30000);

        let parsed: TaskManagerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("TASK_MANAGER_MAX_WORKERS", "4");
        std::env::set_var("TASK_MANAGER_EXCLUDE_TASK_TYPES", "reports:*, legacy ,");
        std::env::set_var("TASK_MANAGER_MAX_ATTEMPTS", "many");

        let config = TaskManagerConfig::from_env();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.exclude_task_types, vec!["reports:*", "legacy"]);
        assert_eq!(config.max_attempts, 3);

        std::env::remove_var("TASK_MANAGER_MAX_WORKERS");
        std::env::remove_var("TASK_MANAGER_EXCLUDE_TASK_TYPES");
        std::env::remove_var("TASK_MANAGER_MAX_ATTEMPTS");
    }
}
