//! Process-wide run-once registry.
//!
//! Maps a caller-supplied identity string to the task currently representing
//! it.  Insertion is a strict check-and-set through the map's entry API, so
//! exactly one of any number of concurrent submissions with the same identity
//! wins; the losers collapse onto the winner (see `task::TaskHandle::submit`).
//! The entry is removed exactly when the registered task finishes, guarded by
//! task identity so a stale finisher can never evict a fresh registrant.
//!
//! The registry is a process-wide singleton: two hosts embedded in the same
//! process share identities.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::task::{TaskCore, TaskId};

static GLOBAL: LazyLock<RunOnceRegistry> = LazyLock::new(RunOnceRegistry::new);

/// The process-wide registry instance.
pub(crate) fn global() -> &'static RunOnceRegistry {
    &GLOBAL
}

pub(crate) struct RunOnceRegistry {
    entries: DashMap<String, Arc<TaskCore>>,
}

impl RunOnceRegistry {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Atomically register `task` as the representative for `key`.
    ///
    /// Returns the already-registered canonical task if the check-and-set
    /// loses.
    pub(crate) fn try_register(
        &self,
        key: &str,
        task: &Arc<TaskCore>,
    ) -> std::result::Result<(), Arc<TaskCore>> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) => Err(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(task));
                tracing::debug!(key = %key, task_id = %task.id, "run-once identity registered");
                Ok(())
            }
        }
    }

    /// Remove the entry for `key` if it is still held by task `id`.
    pub(crate) fn deregister(&self, key: &str, id: TaskId) -> bool {
        let removed = self.entries.remove_if(key, |_, task| task.id == id).is_some();
        if removed {
            tracing::debug!(key = %key, task_id = %id, "run-once identity released");
        }
        removed
    }

    /// The task currently representing `key`, if any.
    #[cfg(test)]
    pub(crate) fn pending(&self, key: &str) -> Option<Arc<TaskCore>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
