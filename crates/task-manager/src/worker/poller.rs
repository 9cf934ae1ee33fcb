//! Task polling lifecycle
//!
//! One loop per node: wait for the poll interval (or a freed slot), claim as
//! many due tasks as there are free workers, hand them to the pool. Pauses
//! while the store is unavailable.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::claiming::TaskClaiming;
use super::pool::{SlotRegistration, WorkerPool};
use super::runner::ClaimedTaskRunner;
use crate::error::TaskManagerError;
use crate::events::{emit, EventSender, TaskLifecycleEvent};
use crate::persistence::{TaskStore, UpdateOptions};
use crate::task::TaskInstance;

/// Observable state of the polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingState {
    Stopped,
    Starting,
    /// Idle between ticks
    Polling,
    Claiming,
    Dispatching,
}

/// Summary of one poll tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollCycleOutcome {
    /// Free worker slots at the start of the tick
    pub capacity: usize,
    /// Tasks claimed and handed to the pool
    pub claimed: usize,
    pub conflicts: usize,
    pub unrecognized: usize,
    /// Claimed tasks the pool refused, released back to idle
    pub released: usize,
}

impl PollCycleOutcome {
    /// Whether worker capacity, not the backlog, limited this tick
    pub fn capacity_bound(&self) -> bool {
        self.capacity == 0 || self.claimed + self.released >= self.capacity
    }
}

pub struct TaskPollingLifecycle {
    store: Arc<TaskStore>,
    pool: Arc<WorkerPool>,
    claiming: TaskClaiming,
    runner: ClaimedTaskRunner,
    events: EventSender,
    poll_interval: watch::Receiver<Duration>,
    max_workers: watch::Receiver<usize>,
    state: watch::Sender<PollingState>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskPollingLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        pool: Arc<WorkerPool>,
        claiming: TaskClaiming,
        events: EventSender,
        poll_interval: watch::Receiver<Duration>,
        max_workers: watch::Receiver<usize>,
        shutdown: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(PollingState::Stopped);
        Arc::new(Self {
            runner: ClaimedTaskRunner::new(Arc::clone(&store), events.clone()),
            store,
            pool,
            claiming,
            events,
            poll_interval,
            max_workers,
            state,
            shutdown,
            shutdown_timeout,
            handle: Mutex::new(None),
        })
    }

    pub fn state(&self) -> watch::Receiver<PollingState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> PollingState {
        *self.state.borrow()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Spawn the polling loop
    pub fn start(self: &Arc<Self>) -> Result<(), TaskManagerError> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(TaskManagerError::Lifecycle(
                "polling lifecycle already started".into(),
            ));
        }
        if self.shutdown.is_cancelled() {
            return Err(TaskManagerError::Lifecycle(
                "polling lifecycle was shut down".into(),
            ));
        }

        self.state.send_replace(PollingState::Starting);
        info!(
            task_manager_id = %self.store.task_manager_id(),
            capacity = self.pool.capacity(),
            poll_interval_ms = self.poll_interval.borrow().as_millis() as u64,
            "starting task polling"
        );

        let lifecycle = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { lifecycle.run_loop().await }));
        Ok(())
    }

    /// Stop claiming and drain in-flight runs (bounded by the shutdown timeout)
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "polling loop ended abnormally");
            }
        }

        if !self.pool.wait_for_idle(self.shutdown_timeout).await {
            warn!(
                in_flight = self.pool.load(),
                "cancelling task runs still in flight after shutdown timeout"
            );
            self.pool.cancel_all();
        }
        self.state.send_replace(PollingState::Stopped);
        info!("task polling stopped");
    }

    async fn run_loop(&self) {
        let mut availability = self.store.availability();
        let mut poll_interval = self.poll_interval.clone();
        let mut expected_start = Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if !*availability.borrow_and_update() {
                debug!("task store unavailable, polling paused");
                self.state.send_replace(PollingState::Polling);
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    changed = availability.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        expected_start = Instant::now();
                        continue;
                    }
                }
            }

            let started = Instant::now();
            let drift = started.saturating_duration_since(expected_start);
            let outcome = self.poll_cycle(drift).await;

            let interval = *poll_interval.borrow_and_update();
            expected_start = Instant::now() + interval;
            let wake_on_release = outcome
                .as_ref()
                .map(PollCycleOutcome::capacity_bound)
                .unwrap_or(false);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.pool.slot_released(), if wake_on_release => {
                    expected_start = Instant::now();
                }
                changed = availability.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Run a single tick immediately
    pub async fn poll_once(&self) -> Result<PollCycleOutcome, TaskManagerError> {
        self.poll_cycle(Duration::ZERO).await
    }

    #[instrument(skip(self), fields(task_manager_id = %self.store.task_manager_id()))]
    async fn poll_cycle(&self, drift: Duration) -> Result<PollCycleOutcome, TaskManagerError> {
        self.pool.set_capacity(*self.max_workers.borrow());

        let capacity = self.pool.available_slots();
        let mut outcome = PollCycleOutcome {
            capacity,
            ..Default::default()
        };
        if capacity == 0 {
            debug!("no free workers, skipping poll");
            self.emit_cycle(&outcome, drift);
            return Ok(outcome);
        }

        self.state.send_replace(PollingState::Claiming);
        let claimed = match self.claiming.claim_available_tasks(capacity, &self.pool).await {
            Ok(claimed) => claimed,
            Err(err) => {
                warn!(error = %err, "failed to poll for work");
                emit(
                    &self.events,
                    TaskLifecycleEvent::PollingError {
                        error: err.to_string(),
                    },
                );
                self.state.send_replace(PollingState::Polling);
                return Err(err);
            }
        };
        outcome.conflicts = claimed.conflicts;
        outcome.unrecognized = claimed.unrecognized;

        self.state.send_replace(PollingState::Dispatching);
        for task in claimed.claimed {
            if self.dispatch(task).await {
                outcome.claimed += 1;
            } else {
                outcome.released += 1;
            }
        }

        self.state.send_replace(PollingState::Polling);
        self.emit_cycle(&outcome, drift);
        Ok(outcome)
    }

    /// Hand a claimed task to the pool; false if it had to be released
    async fn dispatch(&self, task: TaskInstance) -> bool {
        let Some(definition) = self.store.definitions().get(&task.task_type).cloned() else {
            self.release(task, "task type is not registered").await;
            return false;
        };

        let permit = match self.pool.try_admit(&task.task_type, definition.max_concurrency) {
            Ok(permit) => permit,
            Err(err) => {
                self.release(task, &err.to_string()).await;
                return false;
            }
        };

        emit(
            &self.events,
            TaskLifecycleEvent::TaskClaimed {
                task_id: task.id.clone(),
                task_type: task.task_type.clone(),
            },
        );

        let runner = self.runner.clone();
        let registration = SlotRegistration {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            ephemeral: false,
        };
        self.pool.execute(permit, registration, move |cancel| async move {
            runner.run(task, definition, cancel).await
        });
        true
    }

    /// Give a claim back without running it
    async fn release(&self, mut task: TaskInstance, reason: &str) {
        warn!(task_id = %task.id, reason, "releasing claimed task");
        task.release();
        task.attempts = task.attempts.saturating_sub(1);
        if let Err(err) = self.store.update(task, UpdateOptions::unvalidated()).await {
            // The claim expires at retry_at anyway
            warn!(error = %err, "failed to release claimed task");
        }
    }

    fn emit_cycle(&self, outcome: &PollCycleOutcome, drift: Duration) {
        emit(
            &self.events,
            TaskLifecycleEvent::PollingCycle {
                capacity: outcome.capacity,
                claimed: outcome.claimed,
                conflicts: outcome.conflicts,
                unrecognized: outcome.unrecognized,
                drift,
            },
        );
    }
}
