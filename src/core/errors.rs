/*!
 * Error Types
 * Centralized error handling for the synchronization engine and worker pool
 */

use crate::pool::Task;
use thiserror::Error;

/// Result type for synchronizer operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for worker-pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Synchronizer-level errors
///
/// Timeouts are deliberately absent: a deadline that elapses is a
/// distinguished non-error result (`Ok(false)` / `Ok(None)`), never an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A hook (`try_acquire`, ...) was invoked on a primitive that does not
    /// implement that mode.
    #[error("operation not supported by this synchronizer")]
    Unsupported,

    /// A condition-wait operation was invoked without holding the
    /// synchronizer exclusively, or a full release could not be performed.
    #[error("synchronizer is not held exclusively")]
    IllegalState,

    /// Cooperative cancellation was observed during a blocking wait.
    #[error("wait was cancelled")]
    Cancelled,
}

/// Worker-pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool could not accept the task; the task is handed back to the
    /// caller untouched.
    #[error("task rejected by worker pool")]
    Rejected(Task),

    /// Pool construction parameters are inconsistent.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The execution-context factory failed to start a worker.
    #[error("failed to spawn worker context: {0}")]
    SpawnFailed(String),
}
