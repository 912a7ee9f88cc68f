//! Executor error types.
//!
//! Every fallible public API in this crate surfaces errors through
//! [`ExecError`].  Note that most of the submission surface is deliberately
//! infallible: a refused submission returns the canonical task handle instead
//! of an error, and illegal priority or mode changes are ignored (see the
//! module docs in `task`).

use uuid::Uuid;

/// Unified error type for the taskband executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The task body returned an error.  Surfaced when joining on a producer;
    /// action waiters observe the error through `TaskHandle::error` instead.
    #[error("task {task_id} failed: {reason}")]
    TaskFailed {
        /// The [`Uuid`] of the failed task.
        task_id: Uuid,
        /// The error string captured from the task body.
        reason: String,
    },

    /// A task body attempted to join on its own in-flight task, which would
    /// deadlock the worker.  Use the ignore-self join variant from re-entrant
    /// administrative paths.
    #[error("task {task_id} attempted to join on itself")]
    JoinFromOwnTask { task_id: Uuid },

    /// The executor or group has been shut down and no longer builds or
    /// accepts tasks.
    #[error("executor `{name}` is terminated")]
    Terminated { name: String },

    /// A producer finished without a value of the requested type.  This
    /// happens when two run-once submissions with the same identity carry
    /// different result types, or when the task was discarded by shutdown.
    #[error("no result available for task {task_id}")]
    ResultUnavailable { task_id: Uuid },

    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal executor error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExecError>;
