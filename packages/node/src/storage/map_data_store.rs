//! Persistence layer trait for the cache.
//!
//! Defines [`MapDataStore`], the abstraction the facade uses to reach durable
//! storage. Mutations are handed over with [`add()`](MapDataStore::add) /
//! [`remove()`](MapDataStore::remove), which only enqueue; the implementation
//! decides when and how to actually persist. Loads decode rows through the
//! entry codec.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::traits::StoreError;

/// Outcome of one flush pass.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Keys written or deleted successfully.
    pub flushed: u64,
    /// Keys whose write failed or could not be encoded. They remain dirty.
    pub failed: u64,
    /// First failure seen in this pass.
    pub first_error: Option<StoreError>,
}

/// Held for the duration of a load, from before the store is read until the
/// loaded rows are admitted into memory.
///
/// Records how many writes had completed when the load started, so rows
/// for keys whose write completed later can be refused.
#[derive(Debug)]
pub struct LoadTicket {
    since: u64,
    active: Arc<AtomicUsize>,
}

impl LoadTicket {
    /// Registers a running load on `active`; dropping the ticket ends it.
    #[must_use]
    pub fn new(since: u64, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { since, active }
    }

    /// Completed-write count observed when the load started.
    #[must_use]
    pub fn since(&self) -> u64 {
        self.since
    }
}

impl Drop for LoadTicket {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Durable persistence behind the in-memory engine.
///
/// Used as `Arc<dyn MapDataStore<K, V>>`.
#[async_trait]
pub trait MapDataStore<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Queue an upsert of `value` under `key`.
    ///
    /// Never blocks on the backing store. Safe to call while holding the
    /// key's engine lock.
    fn add(&self, key: K, value: Arc<V>);

    /// Queue a delete of `key`.
    fn remove(&self, key: K);

    /// Whether a write for `key` is queued or being flushed.
    fn has_pending_write(&self, key: &K) -> bool;

    /// Starts a load. Take the ticket before reading the store.
    fn begin_load(&self) -> LoadTicket;

    /// Whether a row for `key` read under `ticket` may be inserted into
    /// memory: no write is pending, and no write for the key completed after
    /// the ticket was taken.
    ///
    /// Called under the key's engine lock.
    fn admits_load(&self, key: &K, ticket: &LoadTicket) -> bool;

    /// Number of keys with a pending (not yet durable) write.
    fn pending_operation_count(&self) -> u64;

    /// Load one entry. Undecodable rows yield `Ok(None)`.
    async fn load(&self, key: &K) -> Result<Option<V>, StoreError>;

    /// Load entries in bulk: all rows for `None`, listed keys otherwise.
    /// Undecodable rows are skipped; the second element counts them.
    async fn load_all(&self, keys: Option<&[K]>) -> Result<(Vec<(K, V)>, u64), StoreError>;

    /// Flush every write whose delay has elapsed.
    async fn flush_due(&self) -> FlushReport;

    /// Make every pending write due now; the background sweep writes them.
    ///
    /// Returns how many mutations have been queued since the store was
    /// created, including ones already flushed or coalesced.
    fn soft_flush(&self) -> u64;

    /// Flush all pending writes in the calling task, ignoring delays and
    /// backoff. Used on shutdown.
    ///
    /// # Errors
    ///
    /// Returns the first store failure; affected keys stay pending.
    async fn hard_flush(&self) -> Result<(), StoreError>;
}
