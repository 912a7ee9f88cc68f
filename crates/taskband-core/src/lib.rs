//! Taskband priority-banded task executor.
//!
//! This crate provides the scheduling core that the surrounding tooling
//! funnels its long-running work through:
//!
//! - **[`executor`]** -- Single-queue executor: one FIFO queue drained in
//!   insertion order by a dedicated worker, with suspend/resume, in-flight
//!   priority changes, sync/async dispatch, and graceful shutdown.
//! - **[`group`]** -- Three executors bound to the LOW/NORMAL/HIGH priority
//!   bands, with clamped routing, cross-band re-routing, and group-wide wait
//!   and shutdown.
//! - **[`task`]** -- Action and producer task handles: builder surface,
//!   submission with run-once de-duplication, joins with result retrieval.
//! - **[`locks`]** -- Named-mutex registry interning one lock per string key
//!   for host-wide handshakes.
//! - **[`error`]** -- Unified error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod error;
pub mod executor;
pub mod group;
pub mod locks;
mod once;
pub mod task;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{ExecError, Result};
pub use executor::{DestroyKey, Executor, ExecutorConfig};
pub use group::{Band, ExecutorGroup, HIGH_PRIORITY, LOW_PRIORITY, NORMAL_PRIORITY};
pub use locks::NamedLockRegistry;
pub use task::{ExecutionMode, ProducerTask, TaskHandle, TaskId, TaskInfo, TaskStatus};
