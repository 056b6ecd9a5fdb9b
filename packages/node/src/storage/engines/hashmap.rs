//! In-memory [`StorageEngine`] implementation backed by [`DashMap`].
//!
//! Readers never block each other; writers lock one shard. The `*_with`
//! callbacks run inside the shard's entry lock.

use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::storage::engine::StorageEngine;
use crate::storage::record::Record;

/// Concurrent map of resident records.
pub struct HashMapStorage<K, V> {
    entries: DashMap<K, Record<V>>,
}

impl<K, V> HashMapStorage<K, V>
where
    K: Eq + Hash,
{
    /// Creates a new, empty `HashMapStorage`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, V> Default for HashMapStorage<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> StorageEngine<K, V> for HashMapStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<Record<V>> {
        self.entries.get(key).map(|r| r.clone())
    }

    fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn upsert_with(
        &self,
        key: K,
        build: &mut dyn FnMut(Option<&Record<V>>) -> Record<V>,
    ) -> Option<Record<V>> {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let next = build(Some(occupied.get()));
                Some(occupied.insert(next))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(build(None));
                None
            }
        }
    }

    fn insert_if_absent(&self, key: K, make: &mut dyn FnMut() -> Option<Record<V>>) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => match make() {
                Some(record) => {
                    vacant.insert(record);
                    true
                }
                None => false,
            },
        }
    }

    fn remove_with(
        &self,
        key: &K,
        then: &mut dyn FnMut(Option<&Record<V>>),
    ) -> Option<Record<V>> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                then(Some(occupied.get()));
                Some(occupied.remove())
            }
            Entry::Vacant(_) => {
                then(None);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn snapshot(&self) -> Vec<(K, Record<V>)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::record::Provenance;

    fn record(value: &str) -> Record<String> {
        Record::new(Arc::new(value.to_string()), Provenance::Client)
    }

    #[test]
    fn upsert_with_returns_previous_record() {
        let storage = HashMapStorage::new();

        let first = storage.upsert_with("k".to_string(), &mut |_| record("v1"));
        assert!(first.is_none());

        let second = storage.upsert_with("k".to_string(), &mut |current| {
            assert_eq!(current.map(|r| r.value.as_str()), Some("v1"));
            record("v2")
        });
        assert_eq!(second.map(|r| (*r.value).clone()), Some("v1".to_string()));
        assert_eq!(
            storage.get(&"k".to_string()).map(|r| (*r.value).clone()),
            Some("v2".to_string())
        );
    }

    #[test]
    fn insert_if_absent_keeps_existing_value() {
        let storage = HashMapStorage::new();
        assert!(!storage.insert_if_absent("k".to_string(), &mut || None));
        assert!(storage.is_empty());
        assert!(storage.insert_if_absent("k".to_string(), &mut || Some(record("client"))));
        assert!(!storage.insert_if_absent("k".to_string(), &mut || Some(record("loaded"))));
        assert_eq!(
            storage.get(&"k".to_string()).map(|r| (*r.value).clone()),
            Some("client".to_string())
        );
    }

    #[test]
    fn remove_with_sees_removed_record() {
        let storage = HashMapStorage::new();
        storage.upsert_with("k".to_string(), &mut |_| record("v"));

        let mut seen = None;
        let removed = storage.remove_with(&"k".to_string(), &mut |current| {
            seen = current.map(|r| (*r.value).clone());
        });
        assert!(removed.is_some());
        assert_eq!(seen.as_deref(), Some("v"));
        assert!(storage.is_empty());

        let mut called = false;
        assert!(storage
            .remove_with(&"k".to_string(), &mut |current| {
                called = true;
                assert!(current.is_none());
            })
            .is_none());
        assert!(called);
    }

    #[test]
    fn snapshot_and_keys_cover_all_entries() {
        let storage = HashMapStorage::new();
        for i in 0..10 {
            storage.upsert_with(format!("k{i}"), &mut |_| record("v"));
        }
        assert_eq!(storage.len(), 10);
        assert_eq!(storage.snapshot().len(), 10);
        let mut keys = storage.keys();
        keys.sort();
        assert_eq!(keys.first().map(String::as_str), Some("k0"));
    }
}
