//! The cache facade: map operations over memory with write-behind persistence.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mapstore_core::{CacheKey, CacheValue, ValuePredicate};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CacheConfig, InitialLoadMode};
use crate::lifecycle::{CacheLifecycle, CacheState, InFlightGuard};
use crate::storage::engine::StorageEngine;
use crate::storage::loader::BulkLoader;
use crate::storage::map_data_store::MapDataStore;
use crate::storage::record::{now_millis, Provenance, Record, RecordMetadata};
use crate::storage::scanner::PredicateScanner;
use crate::storage::worker::{BackgroundWorker, FlushRunnable, FlushTask};
use crate::traits::{BackingStore, StoreError};

/// Errors returned by [`MapCache`] mutations and shutdown.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache {map} is not ready")]
    NotReady { map: String },
    #[error("cache {map} is shutting down")]
    ShuttingDown { map: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything the facade is assembled from. Built by
/// [`MapCacheFactory`](crate::storage::MapCacheFactory).
pub(crate) struct CacheParts<K: CacheKey, V: CacheValue> {
    pub instance_id: Uuid,
    pub config: CacheConfig,
    pub store: Arc<dyn BackingStore>,
    pub engine: Arc<dyn StorageEngine<K, V>>,
    pub data_store: Arc<dyn MapDataStore<K, V>>,
    pub loader: BulkLoader<K, V>,
    pub scanner: PredicateScanner<K, V>,
    pub lifecycle: Arc<CacheLifecycle>,
    pub worker: BackgroundWorker<FlushRunnable<K, V>>,
}

/// A write-behind cache over one backing table.
///
/// Memory is authoritative for reads. `put` and `remove` update memory and
/// queue a durable write under the key's lock, then return without touching
/// the backing store; a background worker flushes queued writes once
/// `write_delay` has passed without a newer mutation to the same key.
pub struct MapCache<K: CacheKey, V: CacheValue> {
    instance_id: Uuid,
    config: CacheConfig,
    store: Arc<dyn BackingStore>,
    engine: Arc<dyn StorageEngine<K, V>>,
    data_store: Arc<dyn MapDataStore<K, V>>,
    loader: BulkLoader<K, V>,
    scanner: PredicateScanner<K, V>,
    lifecycle: Arc<CacheLifecycle>,
    worker: Mutex<BackgroundWorker<FlushRunnable<K, V>>>,
    fully_loaded: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> MapCache<K, V> {
    pub(crate) fn from_parts(parts: CacheParts<K, V>) -> Self {
        let fully_loaded = parts.config.initial_load == InitialLoadMode::Eager;
        Self {
            instance_id: parts.instance_id,
            config: parts.config,
            store: parts.store,
            engine: parts.engine,
            data_store: parts.data_store,
            loader: parts.loader,
            scanner: parts.scanner,
            lifecycle: parts.lifecycle,
            worker: Mutex::new(parts.worker),
            fully_loaded: AtomicBool::new(fully_loaded),
        }
    }

    /// Random id of this cache instance, used in log fields.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn map_name(&self) -> &str {
        &self.config.map_name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn state(&self) -> CacheState {
        self.lifecycle.state()
    }

    /// Receiver that reports `true` while the cache is serving.
    pub fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.lifecycle.ready_receiver()
    }

    fn admit_mutation(&self) -> Result<InFlightGuard, CacheError> {
        // Take the guard before reading the state so shutdown either sees
        // this mutation in flight or this mutation sees Draining.
        let guard = self.lifecycle.in_flight_guard();
        match self.lifecycle.state() {
            CacheState::Ready => Ok(guard),
            CacheState::Starting => Err(CacheError::NotReady {
                map: self.config.map_name.clone(),
            }),
            CacheState::Draining | CacheState::Stopped => Err(CacheError::ShuttingDown {
                map: self.config.map_name.clone(),
            }),
        }
    }

    fn put_resident(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        let data_store = &self.data_store;
        let queued_key = key.clone();
        let previous = self.engine.upsert_with(key, &mut |current| {
            data_store.add(queued_key.clone(), Arc::clone(&value));
            let now = now_millis();
            let metadata = match current {
                Some(record) => record.metadata.updated(now),
                None => RecordMetadata::new(now, Provenance::Client),
            };
            Record {
                value: Arc::clone(&value),
                metadata,
            }
        });
        previous.map(|record| record.value)
    }

    fn remove_resident(&self, key: &K) -> Option<Arc<V>> {
        let data_store = &self.data_store;
        let removed = self.engine.remove_with(key, &mut |_| {
            data_store.remove(key.clone());
        });
        removed.map(|record| record.value)
    }

    /// Stores `value` under `key` and queues it for persistence.
    ///
    /// Returns the previous resident value.
    ///
    /// # Errors
    ///
    /// [`CacheError::ShuttingDown`] once [`shutdown`](Self::shutdown) started.
    pub fn put(&self, key: K, value: V) -> Result<Option<Arc<V>>, CacheError> {
        let _guard = self.admit_mutation()?;
        Ok(self.put_resident(key, Arc::new(value)))
    }

    /// Stores every entry; each is queued independently.
    ///
    /// # Errors
    ///
    /// [`CacheError::ShuttingDown`] once [`shutdown`](Self::shutdown) started.
    pub fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<usize, CacheError> {
        let _guard = self.admit_mutation()?;
        let mut count = 0;
        for (key, value) in entries {
            self.put_resident(key, Arc::new(value));
            count += 1;
        }
        Ok(count)
    }

    /// Removes `key` from memory and queues a durable delete.
    ///
    /// The delete is queued even if the key is not resident, so a row that
    /// never made it into memory is still removed.
    ///
    /// # Errors
    ///
    /// [`CacheError::ShuttingDown`] once [`shutdown`](Self::shutdown) started.
    pub fn remove(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
        let _guard = self.admit_mutation()?;
        Ok(self.remove_resident(key))
    }

    /// Removes every listed key. Returns how many were resident.
    ///
    /// # Errors
    ///
    /// [`CacheError::ShuttingDown`] once [`shutdown`](Self::shutdown) started.
    pub fn remove_all(&self, keys: &[K]) -> Result<usize, CacheError> {
        let _guard = self.admit_mutation()?;
        Ok(keys
            .iter()
            .filter(|key| self.remove_resident(key).is_some())
            .count())
    }

    /// Reads `key` from memory.
    ///
    /// In lazy mode a miss loads the key from the backing store unless a write
    /// for it is pending; a load failure is logged and reads as a miss.
    pub async fn get(&self, key: &K) -> Option<Arc<V>> {
        if let Some(record) = self.engine.get(key) {
            return Some(record.value);
        }
        if self.config.initial_load == InitialLoadMode::Eager {
            return None;
        }
        match self.loader.load_one(key.clone()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(map = %self.config.map_name, key = ?key, error = %err, "lazy load failed");
                None
            }
        }
    }

    /// Reads several keys. Lazy mode loads all misses with one bulk lookup.
    pub async fn get_all(&self, keys: &[K]) -> HashMap<K, Arc<V>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            match self.engine.get(key) {
                Some(record) => {
                    found.insert(key.clone(), record.value);
                }
                None => missing.push(key.clone()),
            }
        }

        if missing.is_empty() || self.config.initial_load == InitialLoadMode::Eager {
            return found;
        }
        if let Err(err) = self.loader.load_keys(&missing).await {
            warn!(map = %self.config.map_name, missing = missing.len(), error = %err, "lazy bulk load failed");
            return found;
        }
        for key in missing {
            if let Some(record) = self.engine.get(&key) {
                found.insert(key, record.value);
            }
        }
        found
    }

    /// The resident record for `key` with its metadata: version, creation and
    /// update times, and whether the value was written here or loaded.
    ///
    /// Memory only; never loads.
    pub fn entry(&self, key: &K) -> Option<Record<V>> {
        self.engine.get(key)
    }

    /// Whether `key` is resident in memory.
    pub fn contains_key(&self, key: &K) -> bool {
        self.engine.contains_key(key)
    }

    /// All resident keys.
    pub fn keys(&self) -> Vec<K> {
        self.engine.keys()
    }

    pub fn len(&self) -> usize {
        self.engine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engine.is_empty()
    }

    /// In lazy mode, pulls the whole table into memory once before the first
    /// scan. Returns `false` if that load failed.
    async fn ensure_fully_loaded(&self) -> bool {
        if self.fully_loaded.load(Ordering::Acquire) {
            return true;
        }
        match self.loader.load_all().await {
            Ok(_) => {
                self.fully_loaded.store(true, Ordering::Release);
                true
            }
            Err(err) => {
                warn!(
                    map = %self.config.map_name,
                    error = %err,
                    "backing store unavailable for scan, returning empty result"
                );
                metrics::counter!(
                    "mapstore_degraded_scans_total",
                    "map" => self.config.map_name.clone(),
                    "reason" => "store_unavailable"
                )
                .increment(1);
                false
            }
        }
    }

    /// Keys whose resident value matches `predicate`.
    ///
    /// An empty set means either no match or a scan that could not complete;
    /// failures are logged, never returned.
    pub async fn scan_by_value(&self, predicate: &dyn ValuePredicate<V>) -> HashSet<K> {
        if !self.ensure_fully_loaded().await {
            return HashSet::new();
        }
        self.scanner.scan_keys(predicate)
    }

    /// Matching entries, with the same degradation rules as
    /// [`scan_by_value`](Self::scan_by_value).
    pub async fn scan_values(&self, predicate: &dyn ValuePredicate<V>) -> Vec<(K, Arc<V>)> {
        if !self.ensure_fully_loaded().await {
            return Vec::new();
        }
        self.scanner.scan(predicate)
    }

    /// Number of keys whose latest mutation is not yet durable.
    pub fn pending_writes(&self) -> u64 {
        self.data_store.pending_operation_count()
    }

    /// Makes every pending write due now and wakes the flush worker.
    ///
    /// Returns without waiting for the writes; the sequence number of the
    /// last queued mutation is returned.
    pub async fn flush(&self) -> u64 {
        let sequence = self.data_store.soft_flush();
        if let Err(err) = self.worker.lock().await.try_submit(FlushTask::Sweep) {
            debug!(map = %self.config.map_name, error = %err, "flush sweep not submitted");
        }
        sequence
    }

    /// Stops accepting mutations, waits for in-flight ones, writes every
    /// pending mutation to the backing store, and closes the store.
    ///
    /// Safe to call again if a previous attempt failed.
    ///
    /// # Errors
    ///
    /// Returns the store failure if pending writes could not be flushed;
    /// they remain queued.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        if self.lifecycle.state() == CacheState::Stopped {
            return Ok(());
        }
        let map = self.config.map_name.as_str();
        info!(map, instance = %self.instance_id, pending = self.pending_writes(), "cache draining");

        self.lifecycle.begin_drain();
        if !self.lifecycle.wait_for_drain(self.config.store_timeout).await {
            warn!(map, in_flight = self.lifecycle.in_flight_count(), "in-flight mutations did not drain");
        }

        let mut worker = self.worker.lock().await;
        if worker.is_running() {
            worker.stop().await;
        } else {
            debug!(map, "flush worker already stopped");
        }
        drop(worker);

        if let Err(err) = self.data_store.hard_flush().await {
            error!(map, pending = self.pending_writes(), error = %err, "final flush failed");
            return Err(err.into());
        }
        if let Err(err) = self.store.close().await {
            warn!(map, error = %err, "backing store close failed");
        }

        self.lifecycle.set_stopped();
        info!(map, instance = %self.instance_id, "cache stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mapstore_core::FieldEquals;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::storage::backends::{InMemoryStore, StoreOp};
    use crate::storage::MapCacheFactory;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        first_name: String,
        last_name: String,
    }

    fn user(first: &str, last: &str) -> User {
        User {
            first_name: first.to_string(),
            last_name: last.to_string(),
        }
    }

    async fn cache_over(store: &Arc<InMemoryStore>, mode: InitialLoadMode) -> MapCache<String, User> {
        let config = CacheConfig::new("users").with_initial_load(mode);
        MapCacheFactory::new(config, Arc::clone(store) as Arc<dyn BackingStore>)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn two_puts_in_one_window_write_once() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        cache.put("u1".to_string(), user("Ana", "Lee")).unwrap();
        let previous = cache.put("u1".to_string(), user("Bo", "Lee")).unwrap();
        assert_eq!(previous.as_deref(), Some(&user("Ana", "Lee")));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.writes_for("u1"), 0);
        assert_eq!(cache.pending_writes(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.writes_for("u1"), 1);
        assert_eq!(
            store.payload("u1").as_deref(),
            Some(r#"{"first_name":"Bo","last_name":"Lee"}"#)
        );
        assert_eq!(cache.pending_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn put_then_remove_never_persists_the_value() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        cache.put("u1".to_string(), user("Ana", "Lee")).unwrap();
        let removed = cache.remove(&"u1".to_string()).unwrap();
        assert!(removed.is_some());
        assert!(cache.get(&"u1".to_string()).await.is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.journal(), vec![StoreOp::Remove { id: "u1".to_string() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_store_becomes_ready() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        assert_eq!(cache.state(), CacheState::Ready);
        assert!(*cache.ready_receiver().borrow());
        assert!(cache.is_empty());
        assert!(cache.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn eager_load_skips_undecodable_rows() {
        let store = Arc::new(InMemoryStore::new());
        store.seed("u1", r#"{"first_name":"Ana","last_name":"Lee"}"#);
        store.seed("u2", "{broken");

        let cache = cache_over(&store, InitialLoadMode::Eager).await;
        assert_eq!(cache.keys(), vec!["u1".to_string()]);
        assert_eq!(
            cache.get(&"u1".to_string()).await.as_deref(),
            Some(&user("Ana", "Lee"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn eager_get_never_faults_to_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        store.seed("late", r#"{"first_name":"Cy","last_name":"Ng"}"#);
        assert!(cache.get(&"late".to_string()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_get_loads_on_miss() {
        let store = Arc::new(InMemoryStore::new());
        store.seed("u1", r#"{"first_name":"Ana","last_name":"Lee"}"#);
        let cache = cache_over(&store, InitialLoadMode::Lazy).await;
        assert!(cache.is_empty());

        assert_eq!(
            cache.get(&"u1".to_string()).await.as_deref(),
            Some(&user("Ana", "Lee"))
        );
        assert!(cache.contains_key(&"u1".to_string()));

        store.set_available(false);
        assert!(cache.get(&"u2".to_string()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_metadata_tracks_origin_and_versions() {
        let store = Arc::new(InMemoryStore::new());
        store.seed("u1", r#"{"first_name":"Ana","last_name":"Lee"}"#);
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        let loaded = cache.entry(&"u1".to_string()).unwrap();
        assert_eq!(loaded.metadata.provenance, Provenance::Load);
        assert_eq!(loaded.metadata.version, 1);

        cache.put("u1".to_string(), user("Ana", "Kim")).unwrap();
        let written = cache.entry(&"u1".to_string()).unwrap();
        assert_eq!(written.metadata.provenance, Provenance::Client);
        assert_eq!(written.metadata.version, 2);
        assert_eq!(written.metadata.creation_time, loaded.metadata.creation_time);
        assert_eq!(*written.value, user("Ana", "Kim"));

        cache.put("u2".to_string(), user("Bo", "Lee")).unwrap();
        assert_eq!(cache.entry(&"u2".to_string()).unwrap().metadata.version, 1);
        assert!(cache.entry(&"u3".to_string()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_get_racing_a_flushed_remove_stays_absent() {
        let store = Arc::new(InMemoryStore::new());
        store.seed("u1", r#"{"first_name":"Ana","last_name":"Lee"}"#);
        store.set_read_delay(Some(Duration::from_secs(2)));
        let config = CacheConfig::new("users")
            .with_initial_load(InitialLoadMode::Lazy)
            .with_write_delay(Duration::from_millis(100));
        let cache: Arc<MapCache<String, User>> = Arc::new(
            MapCacheFactory::new(config, Arc::clone(&store) as Arc<dyn BackingStore>)
                .build()
                .await
                .unwrap(),
        );

        let reading = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(&"u1".to_string()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.remove(&"u1".to_string()).unwrap();

        assert!(reading.await.unwrap().is_none());
        assert_eq!(store.payload("u1"), None);
        assert_eq!(cache.pending_writes(), 0);
        assert!(!cache.contains_key(&"u1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn unencodable_value_stays_pending() {
        let store = Arc::new(InMemoryStore::new());
        let cache: MapCache<String, HashMap<(u8, u8), String>> = MapCacheFactory::new(
            CacheConfig::new("grid"),
            Arc::clone(&store) as Arc<dyn BackingStore>,
        )
        .build()
        .await
        .unwrap();

        cache
            .put(
                "g1".to_string(),
                HashMap::from([((0, 0), "origin".to_string())]),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(cache.pending_writes(), 1);
        assert!(cache.contains_key(&"g1".to_string()));
        assert_eq!(store.payload("g1"), None);
        assert!(matches!(
            cache.shutdown().await,
            Err(CacheError::Store(StoreError::Encode(_)))
        ));
        assert_eq!(cache.state(), CacheState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_by_value_matches_first_name() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        cache.put("u1".to_string(), user("Ana", "Lee")).unwrap();
        cache.put("u2".to_string(), user("Ana", "Kim")).unwrap();
        cache.put("u3".to_string(), user("Bo", "Lee")).unwrap();

        let keys = cache
            .scan_by_value(&|u: &User| u.first_name == "Ana")
            .await;
        assert_eq!(keys, HashSet::from(["u1".to_string(), "u2".to_string()]));

        let keys = cache
            .scan_by_value(&FieldEquals::new("first_name", "BO").ignore_case())
            .await;
        assert_eq!(keys, HashSet::from(["u3".to_string()]));

        assert!(cache
            .scan_by_value(&FieldEquals::new("first_name", "Cy"))
            .await
            .is_empty());
        assert_eq!(
            cache.scan_values(&|u: &User| u.last_name == "Kim").await.len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scan_degrades_to_empty_when_store_unavailable() {
        let store = Arc::new(InMemoryStore::new());
        store.seed("u1", r#"{"first_name":"Ana","last_name":"Lee"}"#);
        let cache = cache_over(&store, InitialLoadMode::Lazy).await;

        store.set_available(false);
        let keys = cache.scan_by_value(&|u: &User| u.first_name == "Ana").await;
        assert!(keys.is_empty());

        store.set_available(true);
        let keys = cache.scan_by_value(&|u: &User| u.first_name == "Ana").await;
        assert_eq!(keys, HashSet::from(["u1".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_degrades_to_empty_when_store_times_out() {
        let store = Arc::new(InMemoryStore::new());
        store.seed("u1", r#"{"first_name":"Ana","last_name":"Lee"}"#);
        let config = CacheConfig::new("users")
            .with_initial_load(InitialLoadMode::Lazy)
            .with_store_timeout(Duration::from_secs(1));
        let cache: MapCache<String, User> =
            MapCacheFactory::new(config, Arc::clone(&store) as Arc<dyn BackingStore>)
                .build()
                .await
                .unwrap();

        store.set_latency(Some(Duration::from_secs(5)));
        assert!(cache.scan_by_value(&|_: &User| true).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_is_retried_after_recovery() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        store.set_available(false);
        cache.put("u1".to_string(), user("Ana", "Lee")).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.pending_writes(), 1);
        assert!(store.payload("u1").is_none());

        store.set_available(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.pending_writes(), 0);
        assert!(store.payload("u1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_without_waiting_for_the_delay() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        cache.put("u1".to_string(), user("Ana", "Lee")).unwrap();
        assert_eq!(cache.flush().await, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.payload("u1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_operations() {
        let store = Arc::new(InMemoryStore::new());
        store.seed("cold", r#"{"first_name":"Cy","last_name":"Ng"}"#);
        let cache = cache_over(&store, InitialLoadMode::Lazy).await;

        let stored = cache
            .put_all([
                ("u1".to_string(), user("Ana", "Lee")),
                ("u2".to_string(), user("Bo", "Kim")),
            ])
            .unwrap();
        assert_eq!(stored, 2);

        let found = cache
            .get_all(&["u1".to_string(), "cold".to_string(), "none".to_string()])
            .await;
        assert_eq!(found.len(), 2);
        assert!(found.contains_key("cold"));

        let removed = cache
            .remove_all(&["u1".to_string(), "u2".to_string(), "none".to_string()])
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.keys(), vec!["cold".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_and_rejects_new_writes() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        cache.put("u1".to_string(), user("Ana", "Lee")).unwrap();
        cache.shutdown().await.unwrap();

        assert!(store.payload("u1").is_some());
        assert_eq!(cache.state(), CacheState::Stopped);
        assert!(matches!(
            cache.put("u2".to_string(), user("Bo", "Kim")),
            Err(CacheError::ShuttingDown { .. })
        ));
        cache.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_unflushed_writes() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_over(&store, InitialLoadMode::Eager).await;

        cache.put("u1".to_string(), user("Ana", "Lee")).unwrap();
        store.set_available(false);
        assert!(matches!(cache.shutdown().await, Err(CacheError::Store(_))));
        assert_eq!(cache.pending_writes(), 1);

        store.set_available(true);
        cache.shutdown().await.unwrap();
        assert!(store.payload("u1").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_keep_store_and_memory_in_agreement() {
        let store = Arc::new(InMemoryStore::new());
        let config = CacheConfig::new("users").with_write_delay(Duration::from_millis(5));
        let cache: Arc<MapCache<String, User>> = Arc::new(
            MapCacheFactory::new(config, Arc::clone(&store) as Arc<dyn BackingStore>)
                .build()
                .await
                .unwrap(),
        );

        let writers: Vec<_> = (0..8)
            .map(|writer| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    for i in 0..200 {
                        cache
                            .put("hot".to_string(), user(&format!("w{writer}"), &i.to_string()))
                            .unwrap();
                        if i % 50 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        cache.shutdown().await.unwrap();
        let resident = cache.get(&"hot".to_string()).await.unwrap();
        let durable: User = serde_json::from_str(&store.payload("hot").unwrap()).unwrap();
        assert_eq!(*resident, durable);
    }
}
