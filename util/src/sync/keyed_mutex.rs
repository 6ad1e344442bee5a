use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::FastDashMap;

/// An async mutex per key.
///
/// Locks for different keys never contend. Entries are created on demand
/// and removed once the last guard or waiter for the key is gone.
pub struct KeyedMutex<K: Eq + Hash> {
    locks: Arc<FastDashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self {
            locks: Default::default(),
        }
    }
}

impl<K: Eq + Hash> Clone for KeyedMutex<K> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> KeyedMutexGuard<K> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyedMutexGuard {
            key,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    pub fn try_lock(&self, key: K) -> Option<KeyedMutexGuard<K>> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.try_lock_owned().ok();
        let guard = KeyedMutexGuard {
            key,
            locks: self.locks.clone(),
            guard,
        };
        guard.guard.is_some().then_some(guard)
    }

    /// Returns whether someone holds or waits for the lock.
    pub fn is_locked(&self, key: &K) -> bool {
        self.locks.contains_key(key)
    }

    /// Number of keys which are currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[must_use = "the lock is released when the guard is dropped"]
pub struct KeyedMutexGuard<K: Eq + Hash> {
    key: K,
    locks: Arc<FastDashMap<K, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> KeyedMutexGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for KeyedMutexGuard<K> {
    fn drop(&mut self) {
        // Release the mutex before checking whether the entry is still shared.
        drop(self.guard.take());

        // NOTE: `remove_if` holds the shard lock, so no new waiter can clone
        // the mutex between the check and the removal.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
