//! The concurrent map a group keeps its in-flight calls in.

use std::collections::hash_map::{self, HashMap};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

/// A concurrent map from keys to shared in-flight handles.
///
/// Each operation must be atomic with respect to every other operation on the
/// same key. Entries are compared by identity ([`Arc::ptr_eq`]), never by
/// value, so a stale handle can never remove a newer one registered under the
/// same key.
pub trait Registry<K, T>: Send + Sync {
    /// Stores `value` under `key` unless something is already there.
    ///
    /// Returns the handle now registered for `key` and whether it was already
    /// present (`true`) or `value` was just stored (`false`).
    fn insert_if_absent(&self, key: K, value: Arc<T>) -> (Arc<T>, bool);

    /// Removes the entry for `key` only if it is `expected` itself.
    fn compare_and_remove(&self, key: &K, expected: &Arc<T>) -> bool;

    /// Removes whatever is registered for `key`.
    fn remove(&self, key: &K) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T, S> Registry<K, T> for DashMap<K, Arc<T>, S>
where
    K: Eq + Hash + Send + Sync,
    T: Send + Sync,
    S: BuildHasher + Clone + Send + Sync,
{
    fn insert_if_absent(&self, key: K, value: Arc<T>) -> (Arc<T>, bool) {
        match self.entry(key) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                entry.insert(value.clone());
                (value, false)
            }
        }
    }

    fn compare_and_remove(&self, key: &K, expected: &Arc<T>) -> bool {
        self.remove_if(key, |_, current| Arc::ptr_eq(current, expected))
            .is_some()
    }

    fn remove(&self, key: &K) -> bool {
        DashMap::remove(self, key).is_some()
    }

    fn len(&self) -> usize {
        DashMap::len(self)
    }
}

/// A single lock around a plain map.
///
/// Every registry step for every key goes through the one lock, so prefer the
/// sharded [`DashMap`] for groups with many hot keys. Operations themselves
/// never run under this lock.
impl<K, T, S> Registry<K, T> for RwLock<HashMap<K, Arc<T>, S>>
where
    K: Eq + Hash + Send + Sync,
    T: Send + Sync,
    S: BuildHasher + Send + Sync,
{
    fn insert_if_absent(&self, key: K, value: Arc<T>) -> (Arc<T>, bool) {
        let map = self.upgradable_read();
        if let Some(current) = map.get(&key) {
            return (current.clone(), true);
        }
        let mut map = parking_lot::RwLockUpgradableReadGuard::upgrade(map);
        match map.entry(key) {
            hash_map::Entry::Occupied(entry) => (entry.get().clone(), true),
            hash_map::Entry::Vacant(entry) => {
                entry.insert(value.clone());
                (value, false)
            }
        }
    }

    fn compare_and_remove(&self, key: &K, expected: &Arc<T>) -> bool {
        let mut map = self.write();
        match map.get(key) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                map.remove(key);
                true
            }
            _ => false,
        }
    }

    fn remove(&self, key: &K) -> bool {
        self.write().remove(key).is_some()
    }

    fn len(&self) -> usize {
        self.read().len()
    }
}
