//! Task polling and execution
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                  TaskPollingLifecycle                      │
//! │   tick (poll interval / freed slot / store back online)    │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ capacity = free worker slots
//!                ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                     TaskClaiming                           │
//! │   due tasks, run_at asc → conditional write (running)      │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ claimed tasks
//!                ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                            │
//! │   CAS admission → runner vs timeout → write back → free    │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod claiming;
mod poller;
mod pool;
mod runner;

pub use claiming::{ClaimOwnershipResult, TaskClaiming};
pub use poller::{PollCycleOutcome, PollingState, TaskPollingLifecycle};
pub use pool::{AdmissionPermit, PoolError, SlotRegistration, WorkerPool, WorkerSlotInfo};
pub use runner::{plan_completion, run_with_timeout, ClaimedTaskRunner, CompletionAction, CompletionPlan};
