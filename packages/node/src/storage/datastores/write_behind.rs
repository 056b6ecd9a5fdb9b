//! Write-behind persistence with per-key coalescing.
//!
//! Each mutation replaces the key's pending write and pushes its due time to
//! `now + write_delay`, so only the latest value in a burst reaches the store.
//! A key moves through three phases:
//!
//! ```text
//!   (absent) --add/remove--> Dirty --claimed--> Flushing --ok--> (absent)
//!                              ^                   |
//!                              +---- failed or ----+
//!                                 written-over
//! ```
//!
//! A mutation that lands while its key is `Flushing` marks it for another
//! round instead of being lost. Failed writes stay dirty and are retried after
//! an exponential backoff; a new mutation resets the backoff. This includes
//! writes the codec cannot encode: they are only ever replaced by a newer
//! mutation, never discarded.
//!
//! Completed writes are counted. While a load is running, keys whose write
//! completes are remembered with that count, so the loader can refuse rows
//! whose store read may have raced the write.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use mapstore_core::{CacheKey, CacheValue, EntryCodec};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::{CacheConfig, RetryPolicy};
use crate::storage::map_data_store::{FlushReport, LoadTicket, MapDataStore};
use crate::traits::{BackingStore, StoreError};

#[derive(Debug)]
enum PendingOp<V> {
    Store(Arc<V>),
    Delete,
}

impl<V> Clone for PendingOp<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Store(value) => Self::Store(Arc::clone(value)),
            Self::Delete => Self::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Dirty,
    Flushing { redirty: bool },
}

#[derive(Debug)]
struct PendingWrite<V> {
    op: PendingOp<V>,
    due: Instant,
    phase: Phase,
    attempts: u32,
}

struct Queue<K, V> {
    pending: HashMap<K, PendingWrite<V>>,
    /// Writes completed so far.
    settles: u64,
    /// Settle count of the last write that completed for a key while a load ran.
    settled: HashMap<K, u64>,
}

/// Coalescing write-behind queue in front of a [`BackingStore`].
pub struct WriteBehindDataStore<K, V> {
    map_name: String,
    store: Arc<dyn BackingStore>,
    codec: EntryCodec<K, V>,
    write_delay: Duration,
    retry: RetryPolicy,
    max_concurrent_flushes: usize,
    queue: Mutex<Queue<K, V>>,
    sequence: AtomicU64,
    active_loads: Arc<AtomicUsize>,
}

impl<K: CacheKey, V: CacheValue> WriteBehindDataStore<K, V> {
    pub fn new(store: Arc<dyn BackingStore>, codec: EntryCodec<K, V>, config: &CacheConfig) -> Self {
        Self {
            map_name: config.map_name.clone(),
            store,
            codec,
            write_delay: config.write_delay,
            retry: config.retry.clone(),
            max_concurrent_flushes: config.max_concurrent_flushes.max(1),
            queue: Mutex::new(Queue {
                pending: HashMap::new(),
                settles: 0,
                settled: HashMap::new(),
            }),
            sequence: AtomicU64::new(0),
            active_loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The backing store writes go to.
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// The codec used for keys and payloads.
    pub fn codec(&self) -> &EntryCodec<K, V> {
        &self.codec
    }

    fn enqueue(&self, key: K, op: PendingOp<V>) {
        let due = Instant::now() + self.write_delay;
        let mut queue = self.queue.lock();
        self.sequence.fetch_add(1, Ordering::SeqCst);
        match queue.pending.entry(key) {
            Entry::Occupied(mut occupied) => {
                let write = occupied.get_mut();
                match write.phase {
                    Phase::Dirty => {
                        metrics::counter!("mapstore_coalesced_writes_total", "map" => self.map_name.clone())
                            .increment(1);
                    }
                    Phase::Flushing { .. } => write.phase = Phase::Flushing { redirty: true },
                }
                write.op = op;
                write.due = due;
                write.attempts = 0;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingWrite {
                    op,
                    due,
                    phase: Phase::Dirty,
                    attempts: 0,
                });
            }
        }
        self.record_pending(queue.pending.len());
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_pending(&self, len: usize) {
        metrics::gauge!("mapstore_pending_writes", "map" => self.map_name.clone()).set(len as f64);
    }

    /// Marks dirty keys as flushing and returns what to write for each.
    fn claim(&self, now: Instant, force: bool) -> Vec<(K, PendingOp<V>)> {
        let mut queue = self.queue.lock();
        queue
            .pending
            .iter_mut()
            .filter(|(_, write)| write.phase == Phase::Dirty && (force || write.due <= now))
            .map(|(key, write)| {
                write.phase = Phase::Flushing { redirty: false };
                (key.clone(), write.op.clone())
            })
            .collect()
    }

    async fn write(&self, key: &K, op: &PendingOp<V>) -> Result<(), StoreError> {
        let id = self.codec.encode_key(key)?;
        match op {
            PendingOp::Store(value) => {
                let payload = self.codec.encode_value(value)?;
                self.store.persist(&id, &payload).await
            }
            PendingOp::Delete => self.store.remove(&id).await,
        }
    }

    async fn flush_key(&self, key: K, op: PendingOp<V>) -> Result<(), StoreError> {
        let result = self.write(&key, &op).await;
        self.complete(key, &result);
        result
    }

    fn complete(&self, key: K, result: &Result<(), StoreError>) {
        let mut guard = self.queue.lock();
        let queue = &mut *guard;
        let Some(write) = queue.pending.get_mut(&key) else {
            return;
        };
        let redirty = write.phase == Phase::Flushing { redirty: true };

        let outcome = match result {
            Ok(()) => {
                debug!(map = %self.map_name, key = ?key, "flushed");
                "success"
            }
            Err(err) => {
                if !redirty {
                    write.attempts = write.attempts.saturating_add(1);
                    let backoff = self.retry.backoff(write.attempts);
                    write.due = Instant::now() + backoff;
                    let retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
                    if matches!(err, StoreError::Encode(_)) {
                        error!(
                            map = %self.map_name,
                            key = ?key,
                            attempts = write.attempts,
                            retry_in_ms,
                            error = %err,
                            "write cannot be encoded, keeping it until the key is written again"
                        );
                    } else {
                        warn!(
                            map = %self.map_name,
                            key = ?key,
                            attempts = write.attempts,
                            retry_in_ms,
                            error = %err,
                            "flush failed, will retry"
                        );
                    }
                }
                if matches!(err, StoreError::Encode(_)) {
                    "rejected"
                } else {
                    "failure"
                }
            }
        };
        metrics::counter!("mapstore_flush_total", "map" => self.map_name.clone(), "outcome" => outcome)
            .increment(1);

        if redirty || result.is_err() {
            write.phase = Phase::Dirty;
        } else {
            queue.pending.remove(&key);
            queue.settles += 1;
            if self.active_loads.load(Ordering::SeqCst) > 0 {
                queue.settled.insert(key, queue.settles);
            }
        }
        self.record_pending(queue.pending.len());
    }

    async fn flush_claimed(&self, claimed: Vec<(K, PendingOp<V>)>) -> FlushReport {
        let results: Vec<Result<(), StoreError>> = stream::iter(claimed)
            .map(|(key, op)| self.flush_key(key, op))
            .buffer_unordered(self.max_concurrent_flushes)
            .collect()
            .await;

        let mut report = FlushReport::default();
        for result in results {
            match result {
                Ok(()) => report.flushed += 1,
                Err(err) => {
                    report.failed += 1;
                    report.first_error.get_or_insert(err);
                }
            }
        }
        report
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> MapDataStore<K, V> for WriteBehindDataStore<K, V> {
    fn add(&self, key: K, value: Arc<V>) {
        self.enqueue(key, PendingOp::Store(value));
    }

    fn remove(&self, key: K) {
        self.enqueue(key, PendingOp::Delete);
    }

    fn has_pending_write(&self, key: &K) -> bool {
        self.queue.lock().pending.contains_key(key)
    }

    fn begin_load(&self) -> LoadTicket {
        let mut queue = self.queue.lock();
        if self.active_loads.load(Ordering::SeqCst) == 0 {
            queue.settled.clear();
        }
        LoadTicket::new(queue.settles, Arc::clone(&self.active_loads))
    }

    fn admits_load(&self, key: &K, ticket: &LoadTicket) -> bool {
        let queue = self.queue.lock();
        !queue.pending.contains_key(key)
            && !matches!(queue.settled.get(key), Some(stamp) if *stamp > ticket.since())
    }

    fn pending_operation_count(&self) -> u64 {
        self.queue.lock().pending.len() as u64
    }

    async fn load(&self, key: &K) -> Result<Option<V>, StoreError> {
        let id = match self.codec.encode_key(key) {
            Ok(id) => id,
            Err(err) => {
                warn!(map = %self.map_name, key = ?key, error = %err, "cannot encode key for load");
                return Ok(None);
            }
        };
        let Some(record) = self.store.find(&id).await? else {
            return Ok(None);
        };
        let value = self.codec.decode_value(&record.payload);
        if value.is_none() {
            metrics::counter!("mapstore_decode_failures_total", "map" => self.map_name.clone())
                .increment(1);
        }
        Ok(value)
    }

    async fn load_all(&self, keys: Option<&[K]>) -> Result<(Vec<(K, V)>, u64), StoreError> {
        let records = match keys {
            None => self.store.find_all(None).await?,
            Some(keys) => {
                let ids: Vec<String> = keys
                    .iter()
                    .filter_map(|key| self.codec.encode_key(key).ok())
                    .collect();
                if ids.is_empty() {
                    return Ok((Vec::new(), 0));
                }
                self.store.find_all(Some(&ids)).await?
            }
        };

        let total = records.len();
        let entries: Vec<(K, V)> = records
            .iter()
            .filter_map(|record| self.codec.decode_record(record))
            .collect();
        let skipped = (total - entries.len()) as u64;
        if skipped > 0 {
            metrics::counter!("mapstore_decode_failures_total", "map" => self.map_name.clone())
                .increment(skipped);
        }
        Ok((entries, skipped))
    }

    async fn flush_due(&self) -> FlushReport {
        let claimed = self.claim(Instant::now(), false);
        if claimed.is_empty() {
            return FlushReport::default();
        }
        self.flush_claimed(claimed).await
    }

    fn soft_flush(&self) -> u64 {
        let now = Instant::now();
        for write in self.queue.lock().pending.values_mut() {
            if write.phase == Phase::Dirty {
                write.due = now;
            }
        }
        self.sequence.load(Ordering::SeqCst)
    }

    async fn hard_flush(&self) -> Result<(), StoreError> {
        loop {
            let claimed = self.claim(Instant::now(), true);
            if claimed.is_empty() {
                if self.queue.lock().pending.is_empty() {
                    return Ok(());
                }
                // Another pass owns the remaining keys; wait for it to finish.
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
            let report = self.flush_claimed(claimed).await;
            if let Some(err) = report.first_error {
                return Err(err);
            }
        }
    }
}
