//! Node health snapshots
//!
//! Folds lifecycle events into runtime counters, samples the managed
//! configuration and refreshes a workload aggregation. The latest
//! [`HealthSnapshot`] is always available on a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{duration_millis, MonitoringConfig};
use crate::events::{RunEventOutcome, TaskLifecycleEvent};
use crate::persistence::{AggregationRequest, TaskAggregation, TaskStore};

/// Weight of the newest sample in the drift average
const DRIFT_SMOOTHING: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationStat {
    pub max_workers: usize,
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    pub store_available: bool,
}

/// Counters since node start
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub polling_cycles: u64,
    pub polling_errors: u64,
    pub claimed: u64,
    pub conflicts: u64,
    pub unrecognized: u64,
    pub succeeded: u64,
    /// Failed runs that will be retried
    pub retried: u64,
    /// Failed runs with no attempts left
    pub exhausted: u64,
    pub timed_out: u64,
    pub ephemeral_runs: u64,
    pub ephemeral_rejections: u64,
    /// Smoothed lateness of poll ticks
    pub drift_ms: f64,
    pub max_drift_ms: u64,
    pub last_polling_cycle: Option<DateTime<Utc>>,
}

impl RuntimeStats {
    pub fn record(&mut self, event: &TaskLifecycleEvent, at: DateTime<Utc>) {
        match event {
            TaskLifecycleEvent::PollingCycle {
                claimed,
                conflicts,
                unrecognized,
                drift,
                ..
            } => {
                self.polling_cycles += 1;
                self.claimed += *claimed as u64;
                self.conflicts += *conflicts as u64;
                self.unrecognized += *unrecognized as u64;
                self.last_polling_cycle = Some(at);

                let drift_ms = drift.as_millis() as u64;
                self.max_drift_ms = self.max_drift_ms.max(drift_ms);
                self.drift_ms = if self.polling_cycles == 1 {
                    drift_ms as f64
                } else {
                    self.drift_ms + DRIFT_SMOOTHING * (drift_ms as f64 - self.drift_ms)
                };
            }
            TaskLifecycleEvent::PollingError { .. } => self.polling_errors += 1,
            TaskLifecycleEvent::TaskRunStarted { ephemeral: true, .. } => self.ephemeral_runs += 1,
            TaskLifecycleEvent::TaskRunCompleted { outcome, .. } => match outcome {
                RunEventOutcome::Succeeded => self.succeeded += 1,
                RunEventOutcome::Retrying { .. } => self.retried += 1,
                RunEventOutcome::Exhausted { .. } => self.exhausted += 1,
                RunEventOutcome::TimedOut { .. } => self.timed_out += 1,
            },
            TaskLifecycleEvent::TaskRejected { .. } => self.ephemeral_rejections += 1,
            TaskLifecycleEvent::TaskClaimed { .. } | TaskLifecycleEvent::TaskRunStarted { .. } => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub last_update: DateTime<Utc>,
    pub configuration: ConfigurationStat,
    /// Latest aggregation, `None` until the first refresh succeeds
    pub workload: Option<TaskAggregation>,
    pub runtime: RuntimeStats,
}

/// Inputs sampled by the monitor
pub struct MonitoringSources {
    pub store: Arc<TaskStore>,
    pub events: broadcast::Receiver<TaskLifecycleEvent>,
    pub max_workers: watch::Receiver<usize>,
    pub poll_interval: watch::Receiver<Duration>,
}

pub struct MonitoringStats {
    pub health: watch::Receiver<HealthSnapshot>,
    pub handle: JoinHandle<()>,
}

/// Spawn the monitor; snapshots are logged only when `log_health` is set
pub fn create_monitoring_stats(
    sources: MonitoringSources,
    config: MonitoringConfig,
    log_health: bool,
    shutdown: CancellationToken,
) -> MonitoringStats {
    let MonitoringSources {
        store,
        mut events,
        max_workers,
        poll_interval,
    } = sources;

    let configuration = move |store: &TaskStore| ConfigurationStat {
        max_workers: *max_workers.borrow(),
        poll_interval: *poll_interval.borrow(),
        store_available: store.is_available(),
    };

    let (health_tx, health_rx) = watch::channel(HealthSnapshot {
        last_update: Utc::now(),
        configuration: configuration(&store),
        workload: None,
        runtime: RuntimeStats::default(),
    });

    let handle = tokio::spawn(async move {
        let mut refresh = tokio::time::interval(config.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut log = tokio::time::interval_at(
            Instant::now() + config.log_interval,
            config.log_interval,
        );
        log.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv(), if events_open => match received {
                    Ok(event) => {
                        let now = Utc::now();
                        health_tx.send_modify(|snapshot| {
                            snapshot.runtime.record(&event, now);
                            snapshot.configuration = configuration(&store);
                            snapshot.last_update = now;
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "monitoring lagged behind lifecycle events");
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                _ = refresh.tick() => {
                    let now = Utc::now();
                    match store.aggregate(&AggregationRequest::all(now)).await {
                        Ok(workload) => health_tx.send_modify(|snapshot| {
                            snapshot.workload = Some(workload);
                            snapshot.configuration = configuration(&store);
                            snapshot.last_update = now;
                        }),
                        Err(err) => warn!(error = %err, "failed to refresh task workload"),
                    }
                }
                _ = log.tick(), if log_health => {
                    let snapshot = health_tx.borrow().clone();
                    match serde_json::to_string(&snapshot) {
                        Ok(stats) => info!(stats = %stats, "task manager health"),
                        Err(err) => warn!(error = %err, "failed to serialize health snapshot"),
                    }
                }
            }
        }
    });

    MonitoringStats {
        health: health_rx,
        handle,
    }
}
