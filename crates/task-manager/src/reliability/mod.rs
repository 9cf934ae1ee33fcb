//! Reliability primitives
//!
//! - [`RetryPolicy`] - backoff between failed task attempts
//! - [`retry_on_conflict`] - bounded read-modify-write retries

mod conflict;
mod retry;

pub use conflict::retry_on_conflict;
pub use retry::RetryPolicy;
