//! Single-queue task executor.
//!
//! An [`Executor`] owns one FIFO queue of tasks and one dedicated worker (a
//! long-lived tokio task) that drains it in insertion order.  Producers and
//! actions are built with [`Executor::create_action`] /
//! [`Executor::create_producer`], configured on the handle, and enqueued with
//! `submit`.  Sync tasks run inline on the worker; async tasks are offloaded
//! onto their own spawned context and tracked in an in-flight set.
//!
//! # Worker states
//!
//! The worker alternates between **draining** and **idle**:
//!
//! ```text
//! draining: take head -> run (or dispatch) -> account -> repeat
//! idle:     signal waiters -> park until a submitter wakes the worker
//! ```
//!
//! A suspended worker parks before taking the next head and stays parked
//! until [`Executor::resume`].  Dequeueing happens under the task's own
//! monitor and the queue lock, which serializes it against submitters and
//! against priority re-routing: the worker re-reads priority and mode at the
//! moment it removes the task, so a mutation while queued is never torn.
//!
//! # Priorities
//!
//! The worker carries a priority hint that is retuned to each task it runs
//! and restored to the executor's default afterwards.  Under tokio, thread
//! priority is advisory; ordering between priorities comes from the band
//! structure in [`group`](crate::group), not from this hint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::group::NORMAL_PRIORITY;
use crate::task::{
    ExecutionMode, ProducerTask, TaskCore, TaskHandle, TaskId, TaskStatus, WorkFn,
};

tokio::task_local! {
    /// Identity of the task whose body is executing on this context.
    static CURRENT_TASK: TaskId;
}

/// The task currently running on the calling context, if any.  Used by the
/// self-join guard.
pub(crate) fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK.try_with(|id| *id).ok()
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Construction-time settings for an [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Name used in logs and error messages.
    pub name: String,
    /// Priority given to tasks built without an explicit one.
    pub default_priority: i32,
    /// Worker identity hint.  Tokio tasks have no daemon concept; the flag is
    /// recorded and logged for parity with thread-based hosts.
    pub daemon: bool,
    /// Emit an info record every this-many completions (per mode).
    pub logging_threshold: u64,
}

impl ExecutorConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_priority: NORMAL_PRIORITY,
            daemon: false,
            logging_threshold: 100,
        }
    }

    #[must_use]
    pub fn default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    #[must_use]
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    #[must_use]
    pub fn logging_threshold(mut self, threshold: u64) -> Self {
        self.logging_threshold = threshold;
        self
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new("taskband")
    }
}

/// Capability required to shut down an executor or group constructed as
/// undestroyable.  Returned once, at construction; not cloneable.
pub struct DestroyKey {
    pub(crate) key: Uuid,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Single-queue executor with a dedicated worker.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across threads and
/// tasks.
#[derive(Clone)]
pub struct Executor {
    pub(crate) inner: Arc<ExecutorInner>,
}

pub(crate) struct ExecutorInner {
    name: String,
    daemon: bool,
    logging_threshold: u64,

    /// Insertion-ordered task queue.  Supports removal by identity for the
    /// re-route and dequeue paths.
    queue: Mutex<VecDeque<Arc<TaskCore>>>,

    /// Wakes the worker when new work arrives (one-permit semantics).
    work_available: Notify,
    /// Broadcast whenever the executor may have drained; `wait_for_all`
    /// parks here.
    idle: Notify,
    /// Broadcast by `resume`; a suspended worker parks here.
    resumed: Notify,
    /// Broadcast at every completion; `suspend` observers park here.
    suspension_observer: Notify,

    suspended: AtomicBool,
    terminated: AtomicBool,

    default_priority: AtomicI32,
    /// Advisory priority the worker is currently running at.
    worker_priority: AtomicI32,

    /// The sync task currently on the worker, or the task being handed over
    /// to its async context.  Written only by the worker.
    current: Mutex<Option<Arc<TaskCore>>>,
    /// Async tasks whose dispatch has started and that have not finished.
    in_flight: DashMap<TaskId, Arc<TaskCore>>,

    sync_completed: AtomicU64,
    async_completed: AtomicU64,

    /// Set iff the executor is undestroyable.
    destroy_key: Option<Uuid>,

    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Create a new executor **without** starting the worker.
    ///
    /// Call [`Executor::start`] to spawn the worker onto the tokio runtime,
    /// or use [`Executor::create`] to do both at once.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self::build(config, None)
    }

    /// Create and start an executor.
    #[must_use]
    pub fn create(config: ExecutorConfig) -> Self {
        let executor = Self::new(config);
        executor.start();
        executor
    }

    /// Create and start an executor that refuses the plain
    /// [`shut_down`](Executor::shut_down); termination requires the returned
    /// [`DestroyKey`] via [`shut_down_with`](Executor::shut_down_with).
    #[must_use]
    pub fn undestroyable(config: ExecutorConfig) -> (Self, DestroyKey) {
        let key = Uuid::now_v7();
        let executor = Self::build(config, Some(key));
        executor.start();
        (executor, DestroyKey { key })
    }

    fn build(config: ExecutorConfig, destroy_key: Option<Uuid>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                name: config.name,
                daemon: config.daemon,
                logging_threshold: config.logging_threshold.max(1),
                queue: Mutex::new(VecDeque::new()),
                work_available: Notify::new(),
                idle: Notify::new(),
                resumed: Notify::new(),
                suspension_observer: Notify::new(),
                suspended: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                default_priority: AtomicI32::new(config.default_priority),
                worker_priority: AtomicI32::new(config.default_priority),
                current: Mutex::new(None),
                in_flight: DashMap::new(),
                sync_completed: AtomicU64::new(0),
                async_completed: AtomicU64::new(0),
                destroy_key,
                worker: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ExecutorInner>) -> Self {
        Self { inner }
    }

    /// Spawn the worker that drains the queue.  Idempotent; a no-op on a
    /// terminated executor.
    pub fn start(&self) {
        let mut slot = self.inner.worker.lock().unwrap();
        if slot.is_some() || self.inner.terminated.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move {
            tracing::info!(
                executor = %inner.name,
                daemon = inner.daemon,
                default_priority = inner.default_priority.load(Ordering::Relaxed),
                "executor worker started"
            );
            worker_loop(&inner).await;
            tracing::info!(executor = %inner.name, "executor worker stopped");
        }));
    }

    // -- Task factories -----------------------------------------------------

    /// Build an action task bound to this executor, with the executor's
    /// default priority and sync mode.
    pub fn create_action<F, Fut>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        TaskHandle::new_action(
            f,
            self.inner.default_priority.load(Ordering::Relaxed),
            Arc::downgrade(&self.inner),
            None,
        )
    }

    /// Build a producer task bound to this executor.
    pub fn create_producer<F, Fut, T>(&self, f: F) -> ProducerTask<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
        T: Send + 'static,
    {
        ProducerTask::new_producer(
            f,
            self.inner.default_priority.load(Ordering::Relaxed),
            Arc::downgrade(&self.inner),
            None,
        )
    }

    // -- Waiting ------------------------------------------------------------

    /// Block until `task` is finished.
    pub async fn wait_for(&self, task: &TaskHandle) {
        task.core.effective().wait_finished().await;
    }

    /// Block until `task` is finished, first raising every task queued
    /// strictly ahead of it to at least `priority` (priority inheritance for
    /// the waiter).  The raise stops at the target.
    pub async fn wait_for_at(&self, task: &TaskHandle, priority: i32) {
        let target = task.core.effective().id;
        let ahead: Vec<Arc<TaskCore>> = {
            let queue = self.inner.queue.lock().unwrap();
            let mut ahead = Vec::new();
            for queued in queue.iter() {
                if queued.id == target {
                    break;
                }
                ahead.push(Arc::clone(queued));
            }
            ahead
        };
        for queued in ahead {
            queued.raise_priority(priority);
        }
        task.core.effective().wait_finished().await;
    }

    /// Block until the queue is drained, no task is on the worker, and no
    /// async task is in flight.
    pub async fn wait_for_all(&self) {
        self.wait_for_all_inner(None).await;
    }

    /// [`wait_for_all`](Executor::wait_for_all), first raising the worker and
    /// every queued task to at least `priority`.  The default priority is
    /// restored once the executor is drained.
    pub async fn wait_for_all_at(&self, priority: i32) {
        self.wait_for_all_inner(Some(priority)).await;
    }

    async fn wait_for_all_inner(&self, priority: Option<i32>) {
        let inner = &self.inner;
        if let Some(priority) = priority {
            inner.worker_priority.fetch_max(priority, Ordering::Relaxed);
            for queued in inner.snapshot_queue() {
                queued.raise_priority(priority);
            }
        }
        loop {
            let drained = inner.idle.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if inner.is_drained() {
                break;
            }
            drained.await;
        }
        inner
            .worker_priority
            .store(inner.default_priority.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    // -- Suspension ---------------------------------------------------------

    /// Pause the worker now: set the suspended flag, then wait for the
    /// current task and every async in-flight task to finish.  On return the
    /// worker is parked and no new task starts until [`resume`].
    ///
    /// [`resume`]: Executor::resume
    pub async fn suspend_immediate(&self) {
        self.suspend_immediate_inner(None).await;
    }

    /// [`suspend_immediate`](Executor::suspend_immediate) with a priority
    /// hint applied to the worker while it finishes the current task.
    pub async fn suspend_immediate_at(&self, priority: i32) {
        self.suspend_immediate_inner(Some(priority)).await;
    }

    async fn suspend_immediate_inner(&self, priority: Option<i32>) {
        let inner = &self.inner;
        inner.suspended.store(true, Ordering::SeqCst);
        // Handshake with the dequeue critical section: after this lock
        // round-trip, any dequeue that did not observe the flag has already
        // published its task to the current slot.
        drop(inner.queue.lock().unwrap());
        if let Some(priority) = priority {
            inner.worker_priority.fetch_max(priority, Ordering::Relaxed);
        }
        loop {
            let observed = inner.suspension_observer.notified();
            tokio::pin!(observed);
            observed.as_mut().enable();
            if inner.current.lock().unwrap().is_none() && inner.in_flight.is_empty() {
                break;
            }
            observed.await;
        }
        tracing::debug!(executor = %inner.name, "executor suspended");
    }

    /// Pause the worker once everything currently queued has run: enqueue a
    /// suspension sentinel at the tail and raise the tasks ahead of it to at
    /// least `priority`.  Returns the sentinel so callers can join on the
    /// moment the suspension takes effect.
    pub fn suspend_after_queue(&self, priority: i32) -> TaskHandle {
        for queued in self.inner.snapshot_queue() {
            queued.raise_priority(priority);
        }
        let inner = Arc::clone(&self.inner);
        let sentinel = self.create_action(move || async move {
            inner.suspended.store(true, Ordering::SeqCst);
            Ok(())
        });
        sentinel.set_priority(priority);
        sentinel.submit()
    }

    /// Clear the suspended flag and wake the worker.
    pub fn resume(&self) {
        self.inner.suspended.store(false, Ordering::SeqCst);
        self.inner.resumed.notify_waiters();
        self.inner.work_available.notify_one();
        tracing::debug!(executor = %self.inner.name, "executor resumed");
    }

    // -- Priorities ---------------------------------------------------------

    /// Update the default priority and raise the worker and every queued
    /// task to at least `priority`.
    pub fn set_default_priority(&self, priority: i32) {
        self.inner.default_priority.store(priority, Ordering::Relaxed);
        self.inner.worker_priority.fetch_max(priority, Ordering::Relaxed);
        for queued in self.inner.snapshot_queue() {
            queued.raise_priority(priority);
        }
    }

    // -- Shutdown -----------------------------------------------------------

    /// Orderly termination.
    ///
    /// With `wait` set, drains the queue and the in-flight set, then stops
    /// the worker and awaits its exit.  Without it, lets at most the current
    /// task finish, discards everything still queued (discarded tasks finish
    /// with a captured shutdown error so their waiters are released), and
    /// stops the worker without awaiting.  Subsequent submissions are
    /// refused.
    ///
    /// Returns `false`, with no side effects, on an undestroyable executor;
    /// use [`shut_down_with`](Executor::shut_down_with).
    pub async fn shut_down(&self, wait: bool) -> bool {
        if self.inner.destroy_key.is_some() {
            tracing::warn!(
                executor = %self.inner.name,
                "shutdown refused: executor is undestroyable"
            );
            return false;
        }
        self.shut_down_unchecked(wait).await
    }

    /// [`shut_down`](Executor::shut_down) authorized by the construction-site
    /// capability.  Returns `false` if the key does not match.
    pub async fn shut_down_with(&self, key: &DestroyKey, wait: bool) -> bool {
        if self.inner.destroy_key != Some(key.key) {
            tracing::warn!(
                executor = %self.inner.name,
                "shutdown refused: destroy key mismatch"
            );
            return false;
        }
        self.shut_down_unchecked(wait).await
    }

    pub(crate) async fn shut_down_unchecked(&self, wait: bool) -> bool {
        let inner = &self.inner;
        if inner.terminated.load(Ordering::Acquire) {
            return true;
        }
        tracing::info!(executor = %inner.name, wait, "executor shutdown requested");

        if wait {
            if inner.suspended.load(Ordering::Acquire) {
                self.resume();
            }
            self.wait_for_all().await;
        } else {
            inner.suspended.store(true, Ordering::SeqCst);
            drop(inner.queue.lock().unwrap());
            loop {
                let observed = inner.suspension_observer.notified();
                tokio::pin!(observed);
                observed.as_mut().enable();
                if inner.current.lock().unwrap().is_none() {
                    break;
                }
                observed.await;
            }
        }

        inner.terminated.store(true, Ordering::SeqCst);
        let cleared: Vec<Arc<TaskCore>> = inner.queue.lock().unwrap().drain(..).collect();
        for task in &cleared {
            task.finish(Err("executor shut down".to_string()));
        }
        inner.suspended.store(false, Ordering::SeqCst);
        inner.resumed.notify_waiters();
        inner.work_available.notify_one();
        inner.idle.notify_waiters();

        let executed = inner.sync_completed.load(Ordering::Relaxed)
            + inner.async_completed.load(Ordering::Relaxed);
        let unexecuted = cleared.len();
        tracing::info!(executor = %inner.name, executed, "executed tasks {executed}");
        tracing::info!(executor = %inner.name, unexecuted, "unexecuted tasks {unexecuted}");

        if wait {
            let handle = inner.worker.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
        true
    }

    // -- Accessors ----------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of tasks waiting in the queue.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Completed sync task count (monotone).
    pub fn executed_sync(&self) -> u64 {
        self.inner.sync_completed.load(Ordering::Relaxed)
    }

    /// Completed async task count (monotone).
    pub fn executed_async(&self) -> u64 {
        self.inner.async_completed.load(Ordering::Relaxed)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub fn default_priority(&self) -> i32 {
        self.inner.default_priority.load(Ordering::Relaxed)
    }

    /// The advisory priority the worker is currently running at.
    pub fn current_priority(&self) -> i32 {
        self.inner.worker_priority.load(Ordering::Relaxed)
    }

    pub fn is_daemon(&self) -> bool {
        self.inner.daemon
    }
}

// ---------------------------------------------------------------------------
// Queue internals shared with the task module
// ---------------------------------------------------------------------------

impl ExecutorInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Append a task and wake the worker.  Refuses (returns `false`) when the
    /// executor terminated; checked under the queue lock so a shutdown's
    /// queue drain can never race a straggling submission.
    pub(crate) fn push(&self, task: &Arc<TaskCore>) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        queue.push_back(Arc::clone(task));
        drop(queue);
        self.work_available.notify_one();
        true
    }

    /// Remove a queued task by identity.  Caller holds the task's monitor.
    pub(crate) fn remove_queued(&self, id: TaskId) -> bool {
        let mut queue = self.queue.lock().unwrap();
        match queue.iter().position(|task| task.id == id) {
            Some(index) => {
                let _ = queue.remove(index);
                true
            }
            None => false,
        }
    }

    fn snapshot_queue(&self) -> Vec<Arc<TaskCore>> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }

    fn is_drained(&self) -> bool {
        if !self.queue.lock().unwrap().is_empty() {
            return false;
        }
        if self.current.lock().unwrap().is_some() {
            return false;
        }
        self.in_flight.is_empty()
    }

    /// Count a completion, emit the periodic info record, and wake observers.
    fn account(&self, mode: ExecutionMode) {
        let completed = match mode {
            ExecutionMode::Sync => self.sync_completed.fetch_add(1, Ordering::Relaxed) + 1,
            ExecutionMode::Async => self.async_completed.fetch_add(1, Ordering::Relaxed) + 1,
        };
        if completed % self.logging_threshold == 0 {
            match mode {
                ExecutionMode::Sync => {
                    tracing::info!(executor = %self.name, completed, "executed {completed} sync tasks");
                }
                ExecutionMode::Async => {
                    tracing::info!(executor = %self.name, completed, "executed {completed} async tasks");
                }
            }
        }
        self.suspension_observer.notify_waiters();
        self.idle.notify_waiters();
    }
}

struct Dequeued {
    task: Arc<TaskCore>,
    mode: ExecutionMode,
    priority: i32,
    work: WorkFn,
}

/// Remove the head task under its own monitor.
///
/// Returns `None` when the queue is empty or the executor is suspended or
/// terminated; the caller re-checks those flags at the top of its loop.  The
/// flag check sits inside the queue critical section, paired with the lock
/// round-trip in `suspend`, so a suspension either stops this dequeue or
/// observes its task in the current slot.
fn take_next(inner: &ExecutorInner) -> Option<Dequeued> {
    loop {
        let head = {
            let queue = inner.queue.lock().unwrap();
            queue.front().cloned()
        }?;

        let mut st = head.state.lock().unwrap();
        let mut queue = inner.queue.lock().unwrap();
        if inner.suspended.load(Ordering::Acquire) || inner.terminated.load(Ordering::Acquire) {
            return None;
        }
        let Some(index) = queue.iter().position(|task| task.id == head.id) else {
            // Re-routed to another band while we waited on its monitor.
            drop(queue);
            drop(st);
            continue;
        };
        let _ = queue.remove(index);
        *inner.current.lock().unwrap() = Some(Arc::clone(&head));
        drop(queue);

        st.status = TaskStatus::Running;
        st.started_at = Some(Utc::now());
        let work = st.work.take();
        let mode = st.mode;
        let priority = st.priority;
        drop(st);

        let Some(work) = work else {
            *inner.current.lock().unwrap() = None;
            inner.suspension_observer.notify_waiters();
            continue;
        };
        return Some(Dequeued {
            task: head,
            mode,
            priority,
            work,
        });
    }
}

async fn run_task(inner: &Arc<ExecutorInner>, dequeued: Dequeued) {
    let Dequeued {
        task,
        mode,
        priority,
        work,
    } = dequeued;

    if inner.worker_priority.load(Ordering::Relaxed) != priority {
        inner.worker_priority.store(priority, Ordering::Relaxed);
    }

    match mode {
        ExecutionMode::Sync => {
            let outcome = CURRENT_TASK.scope(task.id, work()).await;
            task.finish(outcome);
            *inner.current.lock().unwrap() = None;
            inner
                .worker_priority
                .store(inner.default_priority.load(Ordering::Relaxed), Ordering::Relaxed);
            inner.account(ExecutionMode::Sync);
        }
        ExecutionMode::Async => {
            // Hand over to a dedicated context; the worker only accounts the
            // dispatch.  The in-flight entry is added before the current slot
            // clears so suspension observers never see a gap.
            inner.in_flight.insert(task.id, Arc::clone(&task));
            *inner.current.lock().unwrap() = None;
            let context = Arc::clone(inner);
            tokio::spawn(async move {
                let outcome = CURRENT_TASK.scope(task.id, work()).await;
                task.finish(outcome);
                context.in_flight.remove(&task.id);
                context.account(ExecutionMode::Async);
            });
            inner
                .worker_priority
                .store(inner.default_priority.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

async fn worker_loop(inner: &Arc<ExecutorInner>) {
    loop {
        if inner.terminated.load(Ordering::Acquire) {
            break;
        }

        if inner.suspended.load(Ordering::Acquire) {
            let resumed = inner.resumed.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();
            if inner.suspended.load(Ordering::Acquire)
                && !inner.terminated.load(Ordering::Acquire)
            {
                resumed.await;
            }
            continue;
        }

        match take_next(inner) {
            Some(dequeued) => run_task(inner, dequeued).await,
            None => {
                inner.idle.notify_waiters();
                let work = inner.work_available.notified();
                tokio::pin!(work);
                work.as_mut().enable();
                if inner.queue.lock().unwrap().is_empty()
                    && !inner.terminated.load(Ordering::Acquire)
                    && !inner.suspended.load(Ordering::Acquire)
                {
                    work.await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn config(name: &str) -> ExecutorConfig {
        ExecutorConfig::new(name).logging_threshold(10)
    }

    #[tokio::test]
    async fn drains_in_submission_order() {
        let executor = Executor::create(config("fifo"));
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            executor
                .create_action(move || async move {
                    order.lock().unwrap().push(tag);
                    Ok(())
                })
                .submit();
        }

        executor.wait_for_all().await;
        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(executor.executed_sync(), 3);
        assert!(executor.shut_down(true).await);
    }

    #[tokio::test]
    async fn queued_before_start_runs_after_start() {
        let executor = Executor::new(config("late-start"));
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        executor
            .create_action(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .submit();

        assert_eq!(executor.pending(), 1);
        executor.start();
        executor.wait_for_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(executor.shut_down(true).await);
    }

    #[tokio::test]
    async fn async_mode_counts_separately() {
        let executor = Executor::create(config("modes"));
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        executor
            .create_action(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .set_async()
            .submit();

        let c = Arc::clone(&counter);
        executor
            .create_action(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .submit();

        executor.wait_for_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(executor.executed_sync(), 1);
        assert_eq!(executor.executed_async(), 1);
        assert!(executor.shut_down(true).await);
    }

    #[tokio::test]
    async fn set_default_priority_raises_queued_tasks() {
        let executor = Executor::new(config("priorities"));
        let first = executor.create_action(|| async { Ok(()) }).submit();
        let second = executor.create_action(|| async { Ok(()) }).submit();

        executor.set_default_priority(9);
        assert_eq!(executor.default_priority(), 9);
        assert_eq!(first.priority(), 9);
        assert_eq!(second.priority(), 9);
    }

    #[tokio::test]
    async fn resubmitting_a_queued_task_is_a_noop() {
        let executor = Executor::new(config("resubmit"));
        let task = executor.create_action(|| async { Ok(()) }).submit();
        task.submit();
        assert_eq!(executor.pending(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn suspend_after_queue_parks_after_pending_work() {
        let executor = Executor::create(config("sentinel"));
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        executor
            .create_action(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .submit();

        let sentinel = executor.suspend_after_queue(9);
        sentinel.join().await.expect("sentinel join");
        // Pending work ran, and the executor is now paused.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(executor.is_suspended());

        let c = Arc::clone(&counter);
        executor
            .create_action(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .submit();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        executor.resume();
        executor.wait_for_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(executor.shut_down(true).await);
    }

    #[tokio::test]
    async fn shut_down_twice_is_idempotent() {
        let executor = Executor::create(config("twice"));
        assert!(executor.shut_down(true).await);
        assert!(executor.shut_down(true).await);
        assert!(executor.is_terminated());
    }

    #[tokio::test]
    async fn undestroyable_requires_the_key() {
        let (executor, key) = Executor::undestroyable(config("locked"));
        assert!(!executor.shut_down(true).await);
        assert!(!executor.is_terminated());

        assert!(executor.shut_down_with(&key, true).await);
        assert!(executor.is_terminated());
    }
}
