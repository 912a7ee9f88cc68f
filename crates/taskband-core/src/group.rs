//! Priority-banded executor group.
//!
//! A group binds three single-queue executors to the **Low**, **Normal**, and
//! **High** bands.  Each band owns an independent worker; there is no
//! cross-band stealing, and ordering across bands comes only from the bands
//! running in parallel.  Submissions are routed by clamped priority:
//!
//! ```text
//! p < NORMAL_PRIORITY    -> Low
//! p < HIGH_PRIORITY      -> Normal
//! otherwise              -> High
//! ```
//!
//! Changing a queued task's priority through its handle re-routes it to the
//! band matching the new value; the removal from the old band happens under
//! the task's monitor, so the re-route can never race the old worker into
//! dropping or double-running the task.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecError, Result};
use crate::executor::{DestroyKey, Executor, ExecutorConfig};
use crate::task::{ProducerTask, TaskCore, TaskHandle, TaskState, TaskStatus};

/// Priority of the low band's worker.
pub const LOW_PRIORITY: i32 = 1;
/// Priority of the normal band's worker, and the crate-wide default.
pub const NORMAL_PRIORITY: i32 = 5;
/// Priority of the high band's worker.
pub const HIGH_PRIORITY: i32 = 10;

// ---------------------------------------------------------------------------
// Bands
// ---------------------------------------------------------------------------

/// One of the three priority lanes of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Band {
    /// Background / best-effort.
    Low,
    /// Default band for most work.
    Normal,
    /// Runs ahead of everything else.
    High,
}

impl Band {
    /// All bands, lowest first.
    pub const ALL: [Band; 3] = [Band::Low, Band::Normal, Band::High];

    /// Clamp an arbitrary priority onto its band.
    #[must_use]
    pub fn of(priority: i32) -> Band {
        if priority < NORMAL_PRIORITY {
            Band::Low
        } else if priority < HIGH_PRIORITY {
            Band::Normal
        } else {
            Band::High
        }
    }

    /// The priority the band's worker runs at by default.
    #[must_use]
    pub fn default_priority(self) -> i32 {
        match self {
            Band::Low => LOW_PRIORITY,
            Band::Normal => NORMAL_PRIORITY,
            Band::High => HIGH_PRIORITY,
        }
    }

    /// Completion-log cadence for the band's executor.  Busier bands log
    /// less often.
    #[must_use]
    pub fn logging_threshold(self) -> u64 {
        match self {
            Band::Low => 1000,
            Band::Normal => 100,
            Band::High => 10,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Band::Low => "low",
            Band::Normal => "normal",
            Band::High => "high",
        }
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// Three priority-banded executors behind one submission surface.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct ExecutorGroup {
    inner: Arc<GroupInner>,
}

pub(crate) struct GroupInner {
    name: String,
    bands: DashMap<Band, Executor>,
    destroy_key: Option<Uuid>,
}

impl ExecutorGroup {
    /// Create a group **without** starting the band workers.
    #[must_use]
    pub fn new(name: impl Into<String>, daemon: bool) -> Self {
        Self::build(name.into(), daemon, None)
    }

    /// Create and start a group.
    #[must_use]
    pub fn create(name: impl Into<String>, daemon: bool) -> Self {
        let group = Self::new(name, daemon);
        group.start();
        group
    }

    /// Create and start a group whose plain [`shut_down`] is refused;
    /// termination requires the returned [`DestroyKey`].
    ///
    /// [`shut_down`]: ExecutorGroup::shut_down
    #[must_use]
    pub fn undestroyable(name: impl Into<String>, daemon: bool) -> (Self, DestroyKey) {
        let key = Uuid::now_v7();
        let group = Self::build(name.into(), daemon, Some(key));
        group.start();
        (group, DestroyKey { key })
    }

    fn build(name: String, daemon: bool, destroy_key: Option<Uuid>) -> Self {
        let inner = Arc::new(GroupInner {
            name: name.clone(),
            bands: DashMap::new(),
            destroy_key,
        });
        for band in Band::ALL {
            let config = ExecutorConfig::new(format!("{name}-{}", band.suffix()))
                .default_priority(band.default_priority())
                .daemon(daemon)
                .logging_threshold(band.logging_threshold());
            inner.bands.insert(band, Executor::new(config));
        }
        Self { inner }
    }

    /// Start every band worker.  Idempotent.
    pub fn start(&self) {
        for executor in self.executors(None) {
            executor.start();
        }
    }

    // -- Task factories -----------------------------------------------------

    /// Build an action task routed to the band matching `priority`.
    pub fn create_action<F, Fut>(&self, f: F, priority: i32) -> Result<TaskHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let executor = self.checked_band(priority)?;
        Ok(TaskHandle::new_action(
            f,
            priority,
            Arc::downgrade(&executor.inner),
            Some(Arc::downgrade(&self.inner)),
        ))
    }

    /// Build a producer task routed to the band matching `priority`.
    pub fn create_producer<F, Fut, T>(&self, f: F, priority: i32) -> Result<ProducerTask<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
        T: Send + 'static,
    {
        let executor = self.checked_band(priority)?;
        Ok(ProducerTask::new_producer(
            f,
            priority,
            Arc::downgrade(&executor.inner),
            Some(Arc::downgrade(&self.inner)),
        ))
    }

    // -- Waiting ------------------------------------------------------------

    /// Block until `task` is finished.
    pub async fn wait_for(&self, task: &TaskHandle) {
        task.core.effective().wait_finished().await;
    }

    /// Block until `task` is finished, raising the tasks queued ahead of it
    /// in its current band to at least `priority`.
    pub async fn wait_for_at(&self, task: &TaskHandle, priority: i32) {
        let home = {
            let core = task.core.effective();
            let st = core.state.lock().unwrap();
            st.home.clone()
        };
        match home.and_then(|weak| weak.upgrade()) {
            Some(inner) => Executor::from_inner(inner).wait_for_at(task, priority).await,
            None => task.core.effective().wait_finished().await,
        }
    }

    /// Drain every band, lowest first.
    pub async fn wait_for_all(&self) {
        for executor in self.executors(None) {
            executor.wait_for_all().await;
        }
    }

    /// Drain every band at the given priority, visiting the destination band
    /// (the one `priority` clamps to) last so late arrivals in the other
    /// bands cannot starve the waiter.
    pub async fn wait_for_all_at(&self, priority: i32) {
        let destination = Band::of(priority);
        for executor in self.executors(Some(destination)) {
            executor.wait_for_all_at(priority).await;
        }
    }

    // -- Suspension ---------------------------------------------------------

    /// Immediately suspend the band matching `priority`.
    pub async fn suspend_immediate(&self, priority: i32) {
        if let Some(executor) = self.band(priority) {
            executor.suspend_immediate().await;
        }
    }

    /// Enqueue a suspension sentinel on the band matching `priority`; see
    /// [`Executor::suspend_after_queue`].
    pub fn suspend_after_queue(&self, priority: i32) -> Option<TaskHandle> {
        self.band(priority)
            .map(|executor| executor.suspend_after_queue(priority))
    }

    /// Resume the band matching `priority`.
    pub fn resume(&self, priority: i32) {
        if let Some(executor) = self.band(priority) {
            executor.resume();
        }
    }

    /// Immediately suspend every band.
    pub async fn suspend_all_immediate(&self) {
        for executor in self.executors(None) {
            executor.suspend_immediate().await;
        }
    }

    /// Resume every band.
    pub fn resume_all(&self) {
        for executor in self.executors(None) {
            executor.resume();
        }
    }

    // -- Shutdown -----------------------------------------------------------

    /// Shut down every band, then clear the band map.  Further factory calls
    /// return [`ExecError::Terminated`].
    ///
    /// Returns `false`, with no side effects, on an undestroyable group.
    pub async fn shut_down(&self, wait: bool) -> bool {
        if self.inner.destroy_key.is_some() {
            tracing::warn!(group = %self.inner.name, "shutdown refused: group is undestroyable");
            return false;
        }
        self.shut_down_unchecked(wait).await
    }

    /// [`shut_down`](ExecutorGroup::shut_down) authorized by the
    /// construction-site capability.
    pub async fn shut_down_with(&self, key: &DestroyKey, wait: bool) -> bool {
        if self.inner.destroy_key != Some(key.key) {
            tracing::warn!(group = %self.inner.name, "shutdown refused: destroy key mismatch");
            return false;
        }
        self.shut_down_unchecked(wait).await
    }

    async fn shut_down_unchecked(&self, wait: bool) -> bool {
        for executor in self.executors(None) {
            executor.shut_down_unchecked(wait).await;
        }
        self.inner.bands.clear();
        tracing::info!(group = %self.inner.name, "executor group shut down");
        true
    }

    // -- Accessors ----------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The executor serving the band `priority` clamps to, if the group is
    /// still running.
    pub fn band(&self, priority: i32) -> Option<Executor> {
        self.inner
            .bands
            .get(&Band::of(priority))
            .map(|entry| entry.value().clone())
    }

    fn checked_band(&self, priority: i32) -> Result<Executor> {
        self.band(priority).ok_or_else(|| ExecError::Terminated {
            name: self.inner.name.clone(),
        })
    }

    /// Band executors in waiting order: lowest first, with `last` (when
    /// given) moved to the back.  Clones the handles out of the map so no
    /// map guard is held across an await.
    fn executors(&self, last: Option<Band>) -> Vec<Executor> {
        let mut ordered: Vec<Band> = Band::ALL.into_iter().filter(|band| Some(*band) != last).collect();
        ordered.extend(last);
        ordered
            .into_iter()
            .filter_map(|band| self.inner.bands.get(&band).map(|entry| entry.value().clone()))
            .collect()
    }
}

impl GroupInner {
    /// Move `core` to the band matching its (already updated) priority.
    /// Caller holds the task's monitor; `st` is its guarded state.
    ///
    /// A created task only has its home rebound.  A queued task is removed
    /// from its old band's queue and appended to the destination band; a task
    /// the old worker has already dequeued is left alone and keeps the new
    /// priority as a hint.
    pub(crate) fn reroute(&self, core: &Arc<TaskCore>, st: &mut TaskState) {
        let Some(destination) = self
            .bands
            .get(&Band::of(st.priority))
            .map(|entry| entry.value().clone())
        else {
            return;
        };

        match st.status {
            TaskStatus::Created => {
                st.home = Some(Arc::downgrade(&destination.inner));
            }
            TaskStatus::Queued => {
                let Some(old) = st.home.as_ref().and_then(Weak::upgrade) else {
                    return;
                };
                if Arc::ptr_eq(&old, &destination.inner) {
                    return;
                }
                if old.remove_queued(core.id) {
                    st.home = Some(Arc::downgrade(&destination.inner));
                    if destination.inner.push(core) {
                        tracing::debug!(
                            task_id = %core.id,
                            from = %old.name(),
                            to = %destination.inner.name(),
                            "task re-routed across bands"
                        );
                    } else {
                        // Destination terminated mid-route; leave the task
                        // resubmittable rather than stranded.
                        st.status = TaskStatus::Created;
                        tracing::debug!(task_id = %core.id, "re-route refused: band terminated");
                    }
                }
            }
            TaskStatus::Running | TaskStatus::Finished => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_clamp_onto_bands() {
        assert_eq!(Band::of(i32::MIN), Band::Low);
        assert_eq!(Band::of(-7), Band::Low);
        assert_eq!(Band::of(0), Band::Low);
        assert_eq!(Band::of(NORMAL_PRIORITY - 1), Band::Low);
        assert_eq!(Band::of(NORMAL_PRIORITY), Band::Normal);
        assert_eq!(Band::of(7), Band::Normal);
        assert_eq!(Band::of(HIGH_PRIORITY - 1), Band::Normal);
        assert_eq!(Band::of(HIGH_PRIORITY), Band::High);
        assert_eq!(Band::of(99), Band::High);
    }

    #[test]
    fn band_defaults_are_ordered() {
        assert!(LOW_PRIORITY < NORMAL_PRIORITY);
        assert!(NORMAL_PRIORITY < HIGH_PRIORITY);
        for band in Band::ALL {
            assert_eq!(Band::of(band.default_priority()), band);
        }
    }

    #[tokio::test]
    async fn routing_picks_the_clamped_band() {
        let group = ExecutorGroup::new("route", false);

        let low = group.create_action(|| async { Ok(()) }, 0).unwrap();
        let normal = group.create_action(|| async { Ok(()) }, 6).unwrap();
        let high = group.create_action(|| async { Ok(()) }, 42).unwrap();
        for task in [&low, &normal, &high] {
            task.submit();
        }

        assert_eq!(group.band(0).unwrap().pending(), 1);
        assert_eq!(group.band(NORMAL_PRIORITY).unwrap().pending(), 1);
        assert_eq!(group.band(HIGH_PRIORITY).unwrap().pending(), 1);
        // Requested priorities are preserved, not clamped.
        assert_eq!(high.priority(), 42);
    }

    #[tokio::test]
    async fn priority_change_moves_a_queued_task() {
        let group = ExecutorGroup::new("reroute", false);

        let task = group.create_action(|| async { Ok(()) }, LOW_PRIORITY).unwrap();
        task.submit();
        assert_eq!(group.band(LOW_PRIORITY).unwrap().pending(), 1);

        task.set_priority(HIGH_PRIORITY);
        assert_eq!(group.band(LOW_PRIORITY).unwrap().pending(), 0);
        assert_eq!(group.band(HIGH_PRIORITY).unwrap().pending(), 1);
    }

    #[tokio::test]
    async fn shut_down_clears_the_band_map() {
        let group = ExecutorGroup::create("teardown", false);
        assert!(group.shut_down(true).await);

        assert!(group.band(NORMAL_PRIORITY).is_none());
        let refused = group.create_action(|| async { Ok(()) }, NORMAL_PRIORITY);
        assert!(matches!(refused, Err(ExecError::Terminated { .. })));
    }
}
