//! Named-mutex registry.
//!
//! Interns one lock object per string key so that independent subsystems of a
//! host can serialize on a shared name without threading lock references
//! through their APIs.  Equal keys always yield the same lock object
//! (reference equality), and entries live until the host tears the registry
//! down with [`NamedLockRegistry::clear`].
//!
//! The registry is not safe against teardown concurrent with lookup: a host
//! must quiesce all users before calling `clear`, otherwise a caller may keep
//! a lock whose key has already been re-interned.
//!
//! # Example
//!
//! ```rust
//! # use taskband_core::NamedLockRegistry;
//! let locks = NamedLockRegistry::new();
//! let a = locks.get("scan:/var/lib");
//! let b = locks.get("scan:/var/lib");
//! assert!(std::sync::Arc::ptr_eq(&a, &b));
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Host-owned table of interned locks, keyed by string.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct NamedLockRegistry {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl NamedLockRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Return the lock interned for `key`, creating it on first use.
    ///
    /// The returned [`Arc`] is identity-stable: every call with an equal key
    /// yields the same lock object.
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of interned keys.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the registry holds no locks.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop every interned lock.  Host teardown only; see the module docs.
    pub fn clear(&self) {
        self.locks.clear();
    }
}

impl Default for NamedLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_share_one_lock() {
        let registry = NamedLockRegistry::new();
        let a = registry.get("pkg:repair");
        let b = registry.get("pkg:repair");
        let c = registry.get("pkg:scan");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn clear_empties_the_table() {
        let registry = NamedLockRegistry::new();
        registry.get("a");
        registry.get("b");
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn interned_lock_serializes_critical_sections() {
        let registry = NamedLockRegistry::new();
        let lock = registry.get("resource");

        let guard = lock.lock().await;
        // A second lookup returns the same mutex, already held.
        let same = registry.get("resource");
        assert!(same.try_lock().is_err());
        drop(guard);
        assert!(same.try_lock().is_ok());
    }
}
