//! Managed configuration: throughput feedback from store errors
//!
//! Store failures that signal overload are counted in a sliding window.
//! While the count is at or above the threshold, each adjustment round
//! removes worker slots and stretches the poll interval, and both creep back
//! to their starting values once errors subside. Results are published on `watch` channels that the
//! polling lifecycle and worker pool follow.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::duration_millis;
use crate::persistence::StoreErrorEvent;

/// Feedback controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedConfigurationSettings {
    /// Time between adjustment rounds
    #[serde(with = "duration_millis")]
    pub adjust_interval: Duration,

    /// How far back errors are counted
    #[serde(with = "duration_millis")]
    pub error_window: Duration,

    /// Errors in the window that trigger a back-off round
    pub error_threshold: usize,

    /// Worker slots never drop below this
    pub min_workers: usize,

    /// Poll interval never grows past this
    #[serde(with = "duration_millis")]
    pub max_poll_interval: Duration,

    /// Back-off step, as a fraction of the starting values
    pub decrease_fraction: f64,

    /// Recovery step, as a fraction of the starting values
    pub recover_fraction: f64,
}

impl Default for ManagedConfigurationSettings {
    fn default() -> Self {
        Self {
            adjust_interval: Duration::from_secs(10),
            error_window: Duration::from_secs(30),
            error_threshold: 1,
            min_workers: 1,
            max_poll_interval: Duration::from_secs(60),
            decrease_fraction: 0.2,
            recover_fraction: 0.05,
        }
    }
}

impl ManagedConfigurationSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.adjust_interval.is_zero() {
            return Err("managed_configuration.adjust_interval must be greater than zero".into());
        }
        if self.error_window < self.adjust_interval {
            return Err("managed_configuration.error_window must cover an adjust interval".into());
        }
        if self.error_threshold == 0 {
            return Err("managed_configuration.error_threshold must be at least 1".into());
        }
        if self.min_workers == 0 {
            return Err("managed_configuration.min_workers must be at least 1".into());
        }
        let fraction_ok = |f: f64| f > 0.0 && f <= 1.0;
        if !fraction_ok(self.decrease_fraction) || !fraction_ok(self.recover_fraction) {
            return Err("managed_configuration fractions must be within (0, 1]".into());
        }
        Ok(())
    }
}

/// The two knobs under management
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub max_workers: usize,
    pub poll_interval: Duration,
}

/// One adjustment round
///
/// Steps are fixed sizes derived from `starting`, so the controller backs off
/// and recovers linearly. The result always stays between the bounds:
/// `min_workers..=starting.max_workers` slots and
/// `starting.poll_interval..=max_poll_interval` between polls.
pub fn adjust(
    current: Throughput,
    starting: Throughput,
    error_count: usize,
    settings: &ManagedConfigurationSettings,
) -> Throughput {
    let worker_floor = settings.min_workers.min(starting.max_workers).max(1);
    let poll_ceiling = settings.max_poll_interval.max(starting.poll_interval);

    if error_count >= settings.error_threshold {
        let worker_step = step_of(starting.max_workers, settings.decrease_fraction);
        let poll_step = starting.poll_interval.mul_f64(settings.decrease_fraction);
        Throughput {
            max_workers: current
                .max_workers
                .saturating_sub(worker_step)
                .max(worker_floor),
            poll_interval: (current.poll_interval + poll_step).min(poll_ceiling),
        }
    } else {
        let worker_step = step_of(starting.max_workers, settings.recover_fraction);
        let poll_step = starting.poll_interval.mul_f64(settings.recover_fraction);
        Throughput {
            max_workers: (current.max_workers + worker_step).min(starting.max_workers),
            poll_interval: current
                .poll_interval
                .saturating_sub(poll_step)
                .max(starting.poll_interval),
        }
    }
}

fn step_of(value: usize, fraction: f64) -> usize {
    ((value as f64 * fraction).ceil() as usize).max(1)
}

/// Running controller and its outputs
pub struct ManagedConfiguration {
    pub max_workers: watch::Receiver<usize>,
    pub poll_interval: watch::Receiver<Duration>,
    pub handle: JoinHandle<()>,
}

/// Spawn the controller over a store error stream
pub fn create_managed_configuration(
    mut errors: broadcast::Receiver<StoreErrorEvent>,
    starting: Throughput,
    settings: ManagedConfigurationSettings,
    shutdown: CancellationToken,
) -> ManagedConfiguration {
    let (workers_tx, workers_rx) = watch::channel(starting.max_workers);
    let (poll_tx, poll_rx) = watch::channel(starting.poll_interval);

    let handle = tokio::spawn(async move {
        let mut current = starting;
        let mut window: VecDeque<Instant> = VecDeque::new();
        let mut errors_open = true;

        let mut ticker = tokio::time::interval_at(
            Instant::now() + settings.adjust_interval,
            settings.adjust_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = errors.recv(), if errors_open => match received {
                    Ok(event) if event.error.signals_overload() => {
                        debug!(operation = event.operation, "store error counted");
                        window.push_back(Instant::now());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let now = Instant::now();
                        window.extend(std::iter::repeat(now).take(missed as usize));
                    }
                    Err(broadcast::error::RecvError::Closed) => errors_open = false,
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    while window
                        .front()
                        .is_some_and(|at| now.duration_since(*at) > settings.error_window)
                    {
                        window.pop_front();
                    }

                    let next = adjust(current, starting, window.len(), &settings);
                    if next == current {
                        continue;
                    }

                    if next.max_workers < current.max_workers
                        || next.poll_interval > current.poll_interval
                    {
                        warn!(
                            errors = window.len(),
                            max_workers = next.max_workers,
                            poll_interval_ms = next.poll_interval.as_millis() as u64,
                            "reducing task manager throughput after store errors"
                        );
                    } else {
                        info!(
                            max_workers = next.max_workers,
                            poll_interval_ms = next.poll_interval.as_millis() as u64,
                            "restoring task manager throughput"
                        );
                    }

                    if next.max_workers != current.max_workers {
                        workers_tx.send_replace(next.max_workers);
                    }
                    if next.poll_interval != current.poll_interval {
                        poll_tx.send_replace(next.poll_interval);
                    }
                    current = next;
                }
            }
        }
    });

    ManagedConfiguration {
        max_workers: workers_rx,
        poll_interval: poll_rx,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn starting() -> Throughput {
        Throughput {
            max_workers: 10,
            poll_interval: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_backs_off_on_errors() {
        let settings = ManagedConfigurationSettings::default();
        let next = adjust(starting(), starting(), 5, &settings);
        assert_eq!(next.max_workers, 8);
        assert_eq!(next.poll_interval, Duration::from_millis(3600));
    }

    #[test]
    fn test_back_off_is_bounded() {
        let settings = ManagedConfigurationSettings::default();
        let mut current = starting();
        for _ in 0..500 {
            current = adjust(current, starting(), 5, &settings);
        }
        assert_eq!(current.max_workers, 1);
        assert_eq!(current.poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_recovers_toward_starting_values() {
        let settings = ManagedConfigurationSettings::default();
        let degraded = Throughput {
            max_workers: 2,
            poll_interval: Duration::from_secs(10),
        };

        let next = adjust(degraded, starting(), 0, &settings);
        assert_eq!(next.max_workers, 3);
        assert_eq!(next.poll_interval, Duration::from_millis(9850));

        let mut current = degraded;
        for _ in 0..500 {
            current = adjust(current, starting(), 0, &settings);
        }
        assert_eq!(current, starting());
    }

    #[test]
    fn test_steady_state_is_stable() {
        let settings = ManagedConfigurationSettings::default();
        assert_eq!(adjust(starting(), starting(), 0, &settings), starting());
    }

    #[test]
    fn test_threshold() {
        let settings = ManagedConfigurationSettings {
            error_threshold: 3,
            ..Default::default()
        };
        assert_eq!(adjust(starting(), starting(), 2, &settings), starting());
        assert_ne!(adjust(starting(), starting(), 3, &settings), starting());
    }

    #[test]
    fn test_settings_validation() {
        assert!(ManagedConfigurationSettings::default().validate().is_ok());
        let bad = ManagedConfigurationSettings {
            decrease_fraction: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
