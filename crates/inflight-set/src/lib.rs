//! In-flight key set
//!
//! Marks a key as "being worked on" and hands back a guard. The marker is
//! removed when the guard is dropped, whether the owning task returned,
//! failed or panicked, so no code path can leave a key stuck in flight.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// A shared set of keys that currently have an operation in flight
pub struct InFlightSet<K> {
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K> InFlightSet<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Mark `key` as in flight.
    ///
    /// Returns `None` if another holder already marked it; the caller should
    /// back off rather than wait.
    pub fn try_acquire(&self, key: K) -> Option<InFlightGuard<K>> {
        let mut keys = lock(&self.keys);
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key,
        })
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        lock(&self.keys).contains(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.keys).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.keys).is_empty()
    }
}

impl<K> Default for InFlightSet<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for InFlightSet<K> {
    fn clone(&self) -> Self {
        Self {
            keys: Arc::clone(&self.keys),
        }
    }
}

impl<K> fmt::Debug for InFlightSet<K>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightSet")
            .field("keys", &*lock(&self.keys))
            .finish()
    }
}

/// Releases its key from the owning [`InFlightSet`] on drop
pub struct InFlightGuard<K>
where
    K: Eq + Hash,
{
    keys: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K> InFlightGuard<K>
where
    K: Eq + Hash,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for InFlightGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        lock(&self.keys).remove(&self.key);
    }
}

impl<K> fmt::Debug for InFlightGuard<K>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightGuard").field("key", &self.key).finish()
    }
}

// A panic while holding the lock cannot leave the set half-updated, so a
// poisoned lock is still safe to use.
fn lock<K>(keys: &Mutex<HashSet<K>>) -> MutexGuard<'_, HashSet<K>> {
    keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
