//! Task objects and the submission API.
//!
//! A task carries a type-erased executable body, an execution mode, an
//! integer priority, and its completion state (result slot, captured error,
//! finished flag).  Tasks are built by an [`Executor`](crate::Executor) or an
//! [`ExecutorGroup`](crate::ExecutorGroup), configured through the builder
//! surface on the handle, and enqueued with [`TaskHandle::submit`].
//!
//! # Lifecycle
//!
//! ```text
//! Created  -->  Queued  -->  Running  -->  Finished
//! ```
//!
//! `Finished` is terminal.  Priority is mutable while `Created` or `Queued`;
//! once the worker has dequeued the task a priority change is a scheduling
//! hint only, and on a finished task it is ignored.  Mode changes are a no-op
//! once the task is running.
//!
//! # Run-once collapse
//!
//! A task built with [`TaskHandle::run_only_once`] names a logical operation.
//! The first submission of an identity registers the task as its canonical
//! representative; any further submission while that task is pending returns
//! the canonical handle, and the losing handle transparently delegates every
//! read and join to it.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{ExecError, Result};
use crate::executor::{self, ExecutorInner};
use crate::group::GroupInner;
use crate::once;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Unique, time-ordered task identifier (UUID v7).
pub type TaskId = Uuid;

/// How the task body is dispatched once the worker drains it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Run inline on the queue's worker.
    Sync,
    /// Run on a dedicated spawned context; the worker only accounts the
    /// dispatch.
    Async,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Built but not yet submitted.
    Created,
    /// Sitting in an executor's queue.
    Queued,
    /// Currently executing.
    Running,
    /// Terminal: result and error are stable and readable by any waiter.
    Finished,
}

/// Metadata snapshot of a task visible to external callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub label: Option<String>,
    pub priority: i32,
    pub mode: ExecutionMode,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Internal task state
// ---------------------------------------------------------------------------

/// The type-erased task body.  Actions resolve to `Ok(None)`, producers to
/// `Ok(Some(value))`; an `Err` string is captured on the task.
pub(crate) type WorkFn = Box<
    dyn FnOnce() -> Pin<
            Box<
                dyn Future<Output = std::result::Result<Option<Box<dyn Any + Send>>, String>>
                    + Send,
            >,
        > + Send,
>;

pub(crate) struct RunOnce {
    pub key: String,
    pub has_run: Box<dyn Fn() -> bool + Send>,
}

/// Mutable task state, guarded by the per-task monitor.
///
/// The monitor serializes enqueue/dequeue/re-route against priority and mode
/// changes: queue membership only ever changes while this lock is held.
pub(crate) struct TaskState {
    pub status: TaskStatus,
    pub mode: ExecutionMode,
    pub priority: i32,
    pub label: Option<String>,
    pub work: Option<WorkFn>,
    pub result: Option<Box<dyn Any + Send>>,
    pub error: Option<String>,
    pub run_once: Option<RunOnce>,
    /// The executor that will run the task; set at creation, rebound on a
    /// cross-band re-route, cleared at finish.
    pub home: Option<Weak<ExecutorInner>>,
    /// The owning group, when the task was built through one.
    pub group: Option<Weak<GroupInner>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskState")
            .field("status", &self.status)
            .field("mode", &self.mode)
            .field("priority", &self.priority)
            .field("label", &self.label)
            .field("error", &self.error)
            .field("started_at", &self.started_at)
            .field("completed_at", &self.completed_at)
            .finish()
    }
}

pub(crate) struct TaskCore {
    pub id: TaskId,
    pub created_at: DateTime<Utc>,
    /// The task monitor.
    pub state: Mutex<TaskState>,
    /// Signaled (broadcast) exactly once, when the task finishes.
    pub done: Notify,
    /// Canonical task this one collapsed onto, if a run-once submission lost
    /// the check-and-set.
    pub delegate: OnceLock<Arc<TaskCore>>,
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("state", &self.state)
            .finish()
    }
}

impl TaskCore {
    pub(crate) fn new(
        work: Option<WorkFn>,
        priority: i32,
        mode: ExecutionMode,
        home: Option<Weak<ExecutorInner>>,
        group: Option<Weak<GroupInner>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Created,
                mode,
                priority,
                label: None,
                work,
                result: None,
                error: None,
                run_once: None,
                home,
                group,
                started_at: None,
                completed_at: None,
            }),
            done: Notify::new(),
            delegate: OnceLock::new(),
        })
    }

    /// Resolve the canonical task: the delegate if this handle collapsed,
    /// otherwise the task itself.
    pub(crate) fn effective(self: &Arc<Self>) -> Arc<TaskCore> {
        self.delegate
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::clone(self))
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().unwrap().status == TaskStatus::Finished
    }

    /// Transition to `Finished`, store the outcome, release the run-once
    /// identity, and wake every waiter.  Idempotent.
    pub(crate) fn finish(
        &self,
        outcome: std::result::Result<Option<Box<dyn Any + Send>>, String>,
    ) {
        let released_key = {
            let mut st = self.state.lock().unwrap();
            if st.status == TaskStatus::Finished {
                return;
            }
            st.status = TaskStatus::Finished;
            st.completed_at = Some(Utc::now());
            st.work = None;
            st.home = None;
            match outcome {
                Ok(result) => st.result = result,
                Err(reason) => {
                    tracing::error!(task_id = %self.id, error = %reason, "task failed");
                    st.error = Some(reason);
                }
            }
            st.run_once.take().map(|run_once| run_once.key)
        };
        if let Some(key) = &released_key {
            once::global().deregister(key, self.id);
        }
        self.done.notify_waiters();
    }

    /// Raise the priority to at least `priority` while the task is still
    /// admissible to its queue.  Never lowers, never re-routes.
    pub(crate) fn raise_priority(&self, priority: i32) {
        let mut st = self.state.lock().unwrap();
        if matches!(st.status, TaskStatus::Created | TaskStatus::Queued) && st.priority < priority
        {
            st.priority = priority;
        }
    }

    /// Park until the task is finished.  Broadcast-safe: the waiter is
    /// registered before the flag is checked, so a completion between check
    /// and await is never lost.
    pub(crate) async fn wait_finished(&self) {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Task handles
// ---------------------------------------------------------------------------

/// Shared handle to an action task.
///
/// Cheaply cloneable; all clones observe the same task.  Builder-style
/// mutators return `&Self` so a configure-and-submit chain reads naturally:
///
/// ```ignore
/// executor.create_action(|| async { Ok(()) }).set_priority(8).submit();
/// ```
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) core: Arc<TaskCore>,
}

impl TaskHandle {
    pub(crate) fn new_action<F, Fut>(
        f: F,
        priority: i32,
        home: Weak<ExecutorInner>,
        group: Option<Weak<GroupInner>>,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let work: WorkFn = Box::new(move || {
            Box::pin(async move {
                f().await?;
                Ok(None)
            })
        });
        Self {
            core: TaskCore::new(Some(work), priority, ExecutionMode::Sync, Some(home), group),
        }
    }

    pub(crate) fn from_core(core: Arc<TaskCore>) -> Self {
        Self { core }
    }

    // -- Builder surface ----------------------------------------------------

    /// Change the task's priority.
    ///
    /// Queued tasks built through a group are re-routed to the band matching
    /// the new priority.  On a task the worker has already dequeued the new
    /// value is a scheduling hint only; on a finished task the call is
    /// ignored.
    pub fn set_priority(&self, priority: i32) -> &Self {
        let core = self.core.effective();
        let mut st = core.state.lock().unwrap();
        match st.status {
            TaskStatus::Created | TaskStatus::Queued => {
                st.priority = priority;
                if let Some(group) = st.group.clone().and_then(|weak| weak.upgrade()) {
                    group.reroute(&core, &mut st);
                }
            }
            TaskStatus::Running => {
                st.priority = priority;
            }
            TaskStatus::Finished => {
                tracing::debug!(task_id = %core.id, "priority change ignored: task finished");
            }
        }
        self
    }

    /// Run the body inline on the queue's worker (the default).
    pub fn set_sync(&self) -> &Self {
        self.set_mode(ExecutionMode::Sync)
    }

    /// Run the body on a dedicated context; the worker only dispatches.
    pub fn set_async(&self) -> &Self {
        self.set_mode(ExecutionMode::Async)
    }

    fn set_mode(&self, mode: ExecutionMode) -> &Self {
        let core = self.core.effective();
        let mut st = core.state.lock().unwrap();
        match st.status {
            TaskStatus::Created | TaskStatus::Queued => st.mode = mode,
            TaskStatus::Running | TaskStatus::Finished => {
                tracing::debug!(task_id = %core.id, ?mode, "mode change ignored");
            }
        }
        self
    }

    /// Give the task a run-once identity.
    ///
    /// At submission, `has_run` is consulted first; if it returns `true` the
    /// task is reported finished without enqueueing.  Otherwise the identity
    /// is claimed process-wide and duplicate submissions collapse onto the
    /// canonical task until it finishes.
    pub fn run_only_once<P>(&self, key: impl Into<String>, has_run: P) -> &Self
    where
        P: Fn() -> bool + Send + 'static,
    {
        let mut st = self.core.state.lock().unwrap();
        if st.status == TaskStatus::Created {
            st.run_once = Some(RunOnce {
                key: key.into(),
                has_run: Box::new(has_run),
            });
        }
        self
    }

    /// Attach a human-readable label, used in logs and [`TaskInfo`].
    pub fn named(&self, label: impl Into<String>) -> &Self {
        let core = self.core.effective();
        let mut st = core.state.lock().unwrap();
        if st.status != TaskStatus::Finished {
            st.label = Some(label.into());
        }
        self
    }

    // -- Submission ---------------------------------------------------------

    /// Enqueue the task on its home executor.
    ///
    /// Returns the canonical handle: the task itself when it was admitted,
    /// the already-registered representative when a run-once submission
    /// collapsed, and the task unchanged when admission was refused (already
    /// submitted or finished, executor terminated).  Refusals are never
    /// errors; callers join on whatever handle comes back.
    pub fn submit(&self) -> TaskHandle {
        if let Some(canonical) = self.core.delegate.get() {
            return TaskHandle::from_core(Arc::clone(canonical));
        }

        let core = &self.core;
        let mut st = core.state.lock().unwrap();

        if st.status != TaskStatus::Created {
            tracing::debug!(task_id = %core.id, status = ?st.status, "submission ignored");
            return self.clone();
        }

        let Some(home) = st.home.as_ref().and_then(Weak::upgrade) else {
            tracing::debug!(task_id = %core.id, "submission ignored: executor dropped");
            return self.clone();
        };
        if home.is_terminated() {
            tracing::debug!(
                task_id = %core.id,
                executor = %home.name(),
                "submission refused: executor terminated"
            );
            return self.clone();
        }

        // Run-once admission: predicate first, then the strict check-and-set.
        let already_ran = st.run_once.as_ref().is_some_and(|ro| (ro.has_run)());
        if already_ran {
            tracing::debug!(task_id = %core.id, "run-once already executed; reported finished");
            st.status = TaskStatus::Finished;
            st.completed_at = Some(Utc::now());
            st.work = None;
            st.home = None;
            st.run_once = None;
            drop(st);
            core.done.notify_waiters();
            return self.clone();
        }

        let mut registered_key = None;
        if let Some(run_once) = &st.run_once {
            match once::global().try_register(&run_once.key, core) {
                Ok(()) => registered_key = Some(run_once.key.clone()),
                Err(canonical) => {
                    drop(st);
                    let canonical = core.delegate.get_or_init(|| canonical);
                    tracing::debug!(
                        task_id = %core.id,
                        canonical = %canonical.id,
                        "run-once submission collapsed"
                    );
                    return TaskHandle::from_core(Arc::clone(canonical));
                }
            }
        }

        st.status = TaskStatus::Queued;
        if home.push(core) {
            tracing::debug!(task_id = %core.id, executor = %home.name(), "task submitted");
            self.clone()
        } else {
            // The executor terminated between the admission check and the
            // enqueue; back out so the task stays resubmittable elsewhere.
            st.status = TaskStatus::Created;
            drop(st);
            if let Some(key) = registered_key {
                once::global().deregister(&key, core.id);
            }
            tracing::debug!(task_id = %core.id, "submission refused: executor terminated");
            self.clone()
        }
    }

    // -- Waiting ------------------------------------------------------------

    /// Block until the task is finished.
    ///
    /// Returns `Ok(())` even when the body failed; inspect [`error`] for the
    /// captured failure.  Joining from inside the task's own body yields
    /// [`ExecError::JoinFromOwnTask`].
    ///
    /// [`error`]: TaskHandle::error
    pub async fn join(&self) -> Result<()> {
        self.join_inner(false).await
    }

    /// [`join`](TaskHandle::join) without the self-join guard, for re-entrant
    /// administrative paths that know the wait cannot deadlock.
    pub async fn join_ignoring_self(&self) -> Result<()> {
        self.join_inner(true).await
    }

    pub(crate) async fn join_inner(&self, ignore_self: bool) -> Result<()> {
        let core = self.core.effective();
        if !ignore_self && executor::current_task_id() == Some(core.id) {
            return Err(ExecError::JoinFromOwnTask { task_id: core.id });
        }
        core.wait_finished().await;
        Ok(())
    }

    // -- Accessors ----------------------------------------------------------

    /// The canonical task's identifier.
    pub fn id(&self) -> TaskId {
        self.core.effective().id
    }

    /// Whether the task has reached its terminal state.
    pub fn finished(&self) -> bool {
        self.core.effective().is_finished()
    }

    /// The error captured from the task body, if it failed.
    pub fn error(&self) -> Option<String> {
        self.core.effective().state.lock().unwrap().error.clone()
    }

    /// Whether the task finished with a captured error.
    pub fn ended_with_errors(&self) -> bool {
        self.error().is_some()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TaskStatus {
        self.core.effective().state.lock().unwrap().status
    }

    /// Current priority.
    pub fn priority(&self) -> i32 {
        self.core.effective().state.lock().unwrap().priority
    }

    /// Current dispatch mode.
    pub fn mode(&self) -> ExecutionMode {
        self.core.effective().state.lock().unwrap().mode
    }

    /// Serializable metadata snapshot.
    pub fn info(&self) -> TaskInfo {
        let core = self.core.effective();
        let st = core.state.lock().unwrap();
        TaskInfo {
            id: core.id,
            label: st.label.clone(),
            priority: st.priority,
            mode: st.mode,
            status: st.status,
            created_at: core.created_at,
            started_at: st.started_at,
            completed_at: st.completed_at,
            error: st.error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Producer tasks
// ---------------------------------------------------------------------------

/// Handle to a task that produces a value.
///
/// The same surface as [`TaskHandle`], plus typed result retrieval: `join`
/// returns the produced value and surfaces a captured error as
/// [`ExecError::TaskFailed`].
pub struct ProducerTask<T> {
    task: TaskHandle,
    _result: PhantomData<fn() -> T>,
}

impl<T> Clone for ProducerTask<T> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            _result: PhantomData,
        }
    }
}

impl<T: Send + 'static> ProducerTask<T> {
    pub(crate) fn new_producer<F, Fut>(
        f: F,
        priority: i32,
        home: Weak<ExecutorInner>,
        group: Option<Weak<GroupInner>>,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
    {
        let work: WorkFn = Box::new(move || {
            Box::pin(async move {
                let value = f().await?;
                Ok(Some(Box::new(value) as Box<dyn Any + Send>))
            })
        });
        Self {
            task: TaskHandle {
                core: TaskCore::new(Some(work), priority, ExecutionMode::Sync, Some(home), group),
            },
            _result: PhantomData,
        }
    }

    /// The untyped handle backing this producer.
    pub fn handle(&self) -> &TaskHandle {
        &self.task
    }

    /// See [`TaskHandle::set_priority`].
    pub fn set_priority(&self, priority: i32) -> &Self {
        self.task.set_priority(priority);
        self
    }

    /// See [`TaskHandle::set_sync`].
    pub fn set_sync(&self) -> &Self {
        self.task.set_sync();
        self
    }

    /// See [`TaskHandle::set_async`].
    pub fn set_async(&self) -> &Self {
        self.task.set_async();
        self
    }

    /// See [`TaskHandle::run_only_once`].
    pub fn run_only_once<P>(&self, key: impl Into<String>, has_run: P) -> &Self
    where
        P: Fn() -> bool + Send + 'static,
    {
        self.task.run_only_once(key, has_run);
        self
    }

    /// See [`TaskHandle::named`].
    pub fn named(&self, label: impl Into<String>) -> &Self {
        self.task.named(label);
        self
    }

    /// See [`TaskHandle::submit`].  The returned handle is the canonical
    /// producer for this task's run-once identity.
    pub fn submit(&self) -> ProducerTask<T> {
        ProducerTask {
            task: self.task.submit(),
            _result: PhantomData,
        }
    }

    /// Block until finished and return the produced value.
    ///
    /// A captured task error surfaces as [`ExecError::TaskFailed`]; a missing
    /// or differently-typed result as [`ExecError::ResultUnavailable`].
    pub async fn join(&self) -> Result<T>
    where
        T: Clone,
    {
        self.join_with(false).await
    }

    /// [`join`](ProducerTask::join) without the self-join guard.
    pub async fn join_ignoring_self(&self) -> Result<T>
    where
        T: Clone,
    {
        self.join_with(true).await
    }

    async fn join_with(&self, ignore_self: bool) -> Result<T>
    where
        T: Clone,
    {
        self.task.join_inner(ignore_self).await?;
        let core = self.task.core.effective();
        let st = core.state.lock().unwrap();
        if let Some(reason) = &st.error {
            return Err(ExecError::TaskFailed {
                task_id: core.id,
                reason: reason.clone(),
            });
        }
        st.result
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
            .ok_or(ExecError::ResultUnavailable { task_id: core.id })
    }

    /// The produced value, if the task has finished successfully.  Stable:
    /// repeated reads return equal clones.
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        let core = self.task.core.effective();
        let st = core.state.lock().unwrap();
        if st.status != TaskStatus::Finished {
            return None;
        }
        st.result
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// See [`TaskHandle::id`].
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// See [`TaskHandle::finished`].
    pub fn finished(&self) -> bool {
        self.task.finished()
    }

    /// See [`TaskHandle::error`].
    pub fn error(&self) -> Option<String> {
        self.task.error()
    }

    /// See [`TaskHandle::ended_with_errors`].
    pub fn ended_with_errors(&self) -> bool {
        self.task.ended_with_errors()
    }

    /// See [`TaskHandle::info`].
    pub fn info(&self) -> TaskInfo {
        self.task.info()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::group::NORMAL_PRIORITY;

    /// A detached task core with no body and no home executor.
    pub(crate) fn bare_core() -> Arc<TaskCore> {
        TaskCore::new(None, NORMAL_PRIORITY, ExecutionMode::Sync, None, None)
    }
}
