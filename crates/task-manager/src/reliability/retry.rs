//! Retry backoff for failed task runs

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// Backoff applied between failed attempts of a task instance
///
/// How many attempts a task gets is decided by its definition
/// (`max_attempts`); the policy only shapes the delay.
///
/// # Example
///
/// ```
/// use everruns_task_manager::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_initial_interval(Duration::from_secs(10))
///     .with_max_interval(Duration::from_secs(600))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(40));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor per failed attempt
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0), 0.1 means +/-10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 30s, 60s, 120s ... capped at 1h, 10% jitter
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(60 * 60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Same delay after every failure
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Retry on the next poll
    pub fn no_delay() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after `attempts` failed attempts (1-based)
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        if jittered.is_finite() {
            Duration::from_secs_f64(jittered)
        } else {
            self.max_interval
        }
    }
}
