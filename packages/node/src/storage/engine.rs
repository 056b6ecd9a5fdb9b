//! In-memory storage engine trait.
//!
//! Defines [`StorageEngine`], the innermost layer that holds resident entries.
//! It is the seam where a distributed map substrate would plug in; the
//! bundled implementation is a single-node concurrent hash map.

use super::record::Record;

/// Concurrent key-value storage for resident records.
///
/// All operations are synchronous and non-blocking with respect to the
/// backing store. Per-key operations are linearizable: `upsert_with` and
/// `remove_with` run their callback while holding the key's write lock, so
/// side effects issued from the callback are ordered exactly like the writes.
///
/// Wrapped in `Arc<dyn StorageEngine<K, V>>` for sharing across tasks.
pub trait StorageEngine<K, V>: Send + Sync + 'static {
    /// Retrieve a record by key, or `None` if not present.
    fn get(&self, key: &K) -> Option<Record<V>>;

    /// Check if a key is resident without cloning the record.
    fn contains_key(&self, key: &K) -> bool;

    /// Insert or replace a record under the key's write lock.
    ///
    /// `build` receives the current record (if any) and returns the new one;
    /// it runs exactly once while the lock is held. Returns the previous record.
    fn upsert_with(
        &self,
        key: K,
        build: &mut dyn FnMut(Option<&Record<V>>) -> Record<V>,
    ) -> Option<Record<V>>;

    /// Insert only if the key is absent. Returns `true` if inserted.
    ///
    /// `make` runs under the key's write lock and only when the key is
    /// absent; returning `None` leaves the key absent.
    fn insert_if_absent(&self, key: K, make: &mut dyn FnMut() -> Option<Record<V>>) -> bool;

    /// Remove a record under the key's write lock.
    ///
    /// `then` receives the removed record (if any) before the lock is released.
    fn remove_with(
        &self,
        key: &K,
        then: &mut dyn FnMut(Option<&Record<V>>),
    ) -> Option<Record<V>>;

    /// Number of resident entries.
    fn len(&self) -> usize;

    /// Whether no entries are resident.
    fn is_empty(&self) -> bool;

    /// All resident keys.
    fn keys(&self) -> Vec<K>;

    /// Point-in-time snapshot of all entries.
    ///
    /// Mutation-tolerant: concurrent writers are never blocked for longer than
    /// one shard copy, and each returned value is a complete `Arc` snapshot.
    fn snapshot(&self) -> Vec<(K, Record<V>)>;
}
