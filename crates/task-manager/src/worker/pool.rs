//! Worker pool: bounded, per-type limited execution slots
//!
//! Admission is two compare-and-swap steps, first on the global load and
//! then on the task type's counter, with the global step rolled back if the
//! type is saturated. An admitted run holds an [`AdmissionPermit`] which frees
//! both counters when dropped.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TaskManagerError;

/// Admission refusals
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is at capacity ({capacity} workers)")]
    AtCapacity { capacity: usize },

    #[error("task type {task_type} is at its concurrency limit ({limit})")]
    TypeSaturated { task_type: String, limit: usize },
}

impl From<PoolError> for TaskManagerError {
    fn from(err: PoolError) -> Self {
        Self::CapacityExceeded(err.to_string())
    }
}

/// In-flight run, as reported by [`WorkerPool::in_flight`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSlotInfo {
    pub task_id: String,
    pub task_type: String,
    pub started_at: DateTime<Utc>,
    pub ephemeral: bool,
}

struct WorkerSlot {
    run: u64,
    info: WorkerSlotInfo,
    cancel: CancellationToken,
}

/// Identity of a run handed to [`WorkerPool::execute`]
#[derive(Debug, Clone)]
pub struct SlotRegistration {
    pub task_id: String,
    pub task_type: String,
    pub ephemeral: bool,
}

pub struct WorkerPool {
    capacity: AtomicUsize,
    load: AtomicUsize,
    type_load: DashMap<String, AtomicUsize>,
    slots: DashMap<String, WorkerSlot>,
    next_run: AtomicU64,
    released: Notify,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: AtomicUsize::new(capacity.max(1)),
            load: AtomicUsize::new(0),
            type_load: DashMap::new(),
            slots: DashMap::new(),
            next_run: AtomicU64::new(0),
            released: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Change the slot count; running work above the new capacity is not
    /// preempted, it just blocks admissions until enough runs finish
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let previous = self.capacity.swap(capacity, Ordering::SeqCst);
        if previous != capacity {
            debug!(previous, capacity, "worker pool capacity changed");
            if capacity > previous {
                self.released.notify_one();
            }
        }
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    pub fn available_slots(&self) -> usize {
        self.capacity().saturating_sub(self.load())
    }

    /// Runs of `task_type` currently admitted
    pub fn type_load(&self, task_type: &str) -> usize {
        self.type_load
            .get(task_type)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Admit one run of `task_type`, or refuse without side effects
    pub fn try_admit(
        self: &Arc<Self>,
        task_type: &str,
        max_concurrency: Option<usize>,
    ) -> Result<AdmissionPermit, PoolError> {
        let capacity = self.capacity();
        self.load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |load| {
                (load < capacity).then_some(load + 1)
            })
            .map_err(|_| PoolError::AtCapacity { capacity })?;

        let limit = max_concurrency.unwrap_or(usize::MAX);
        let admitted = self
            .type_load
            .entry(task_type.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < limit).then_some(count + 1)
            })
            .is_ok();

        if !admitted {
            self.load.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::TypeSaturated {
                task_type: task_type.to_string(),
                limit,
            });
        }

        Ok(AdmissionPermit {
            pool: Arc::clone(self),
            task_type: task_type.to_string(),
        })
    }

    /// Run `work` in a slot; the permit and the slot are released when it
    /// finishes
    ///
    /// `work` receives the run's cancellation token, which [`cancel`] and
    /// [`cancel_all`] trigger.
    ///
    /// [`cancel`]: WorkerPool::cancel
    /// [`cancel_all`]: WorkerPool::cancel_all
    pub fn execute<F, Fut>(
        self: &Arc<Self>,
        permit: AdmissionPermit,
        registration: SlotRegistration,
        work: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let run = self.next_run.fetch_add(1, Ordering::SeqCst);
        let key = registration.task_id.clone();
        self.slots.insert(
            key.clone(),
            WorkerSlot {
                run,
                info: WorkerSlotInfo {
                    task_id: registration.task_id,
                    task_type: registration.task_type,
                    started_at: Utc::now(),
                    ephemeral: registration.ephemeral,
                },
                cancel: cancel.clone(),
            },
        );

        let fut = work(cancel);
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            fut.await;
            // A reclaimed task may already occupy the key with a newer run
            pool.slots.remove_if(&key, |_, slot| slot.run == run);
            drop(permit);
        })
    }

    /// Snapshot of running work
    pub fn in_flight(&self) -> Vec<WorkerSlotInfo> {
        let mut slots: Vec<WorkerSlotInfo> =
            self.slots.iter().map(|slot| slot.info.clone()).collect();
        slots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        slots
    }

    /// Signal cancellation to a running task; false if it is not running here
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.slots.get(task_id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for slot in self.slots.iter() {
            slot.cancel.cancel();
        }
    }

    /// Resolves after a slot was freed (or capacity grew)
    pub async fn slot_released(&self) {
        self.released.notified().await
    }

    /// Wait until nothing runs, up to `timeout`; false on timeout
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.load() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.load(), "worker pool did not drain in time");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity())
            .field("load", &self.load())
            .finish()
    }
}

/// Held while a run occupies a slot
#[must_use = "dropping the permit frees the slot"]
pub struct AdmissionPermit {
    pool: Arc<WorkerPool>,
    task_type: String,
}

impl AdmissionPermit {
    pub fn task_type(&self) -> &str {
        &self.task_type
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(counter) = self.pool.type_load.get(&self.task_type) {
            let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        }
        let _ = self
            .pool
            .load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |l| l.checked_sub(1));
        self.pool.released.notify_one();
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("task_type", &self.task_type)
            .finish()
    }
}
