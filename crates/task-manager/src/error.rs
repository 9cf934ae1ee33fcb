//! Error taxonomy for the task manager
//!
//! Store-level failures are [`StoreError`]; everything callers of the
//! scheduling API see is a [`TaskManagerError`]. Runner failures never reach
//! callers directly, they feed the retry policy of the task instance (see
//! [`crate::definition::TaskRunFailure`]).

use crate::definition::RegistryError;
use crate::persistence::StoreError;

/// Errors surfaced by the task manager API
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskManagerError {
    /// The document changed since it was read (optimistic concurrency)
    #[error("version conflict on task {0}")]
    VersionConflict(String),

    /// Malformed task instance or unregistered task type
    #[error("validation error: {0}")]
    Validation(String),

    /// Worker pool or ephemeral admission refused
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Transient infrastructure failure, callers should retry later
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Task instance does not exist
    #[error("task not found: {0}")]
    NotFound(String),

    /// A task with the same id already exists
    #[error("task already exists: {0}")]
    Conflict(String),

    /// Any other store failure
    #[error("store error: {0}")]
    Store(String),

    /// Lifecycle misuse (start twice, use after shutdown)
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

impl TaskManagerError {
    /// Whether this is an optimistic-concurrency conflict
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict(_))
    }

    /// Whether this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for TaskManagerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::AlreadyExists(id) => Self::Conflict(id),
            StoreError::VersionConflict { id, .. } => Self::VersionConflict(id),
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Store(msg),
        }
    }
}

impl From<RegistryError> for TaskManagerError {
    fn from(err: RegistryError) -> Self {
        Self::Validation(err.to_string())
    }
}
