//! Read-modify-write retries on optimistic-concurrency conflicts

use std::future::Future;

use tracing::debug;

use crate::error::TaskManagerError;

/// Run `op` until it succeeds, fails with something other than a version
/// conflict, or `max_attempts` attempts were made
///
/// `op` receives the 1-based attempt number and must re-read the document on
/// every attempt so the intent is reapplied to the latest version.
pub async fn retry_on_conflict<T, F, Fut>(
    max_attempts: u32,
    mut op: F,
) -> Result<T, TaskManagerError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TaskManagerError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Err(err) if err.is_version_conflict() && attempt < max_attempts => {
                debug!(attempt, error = %err, "version conflict, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}
