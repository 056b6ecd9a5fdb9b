//! Assembly of a [`MapCache`] from its layers.
//!
//! Every dependency is passed in; nothing is global. `build` wires the
//! layers, runs the initial load, and returns a cache only once it is ready.

use std::sync::Arc;

use mapstore_core::{CacheKey, CacheValue, EntryCodec};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::cache::{CacheParts, MapCache};
use crate::config::{CacheConfig, InitialLoadMode};
use crate::lifecycle::CacheLifecycle;
use crate::storage::backends::TimeoutStore;
use crate::storage::datastores::WriteBehindDataStore;
use crate::storage::engine::StorageEngine;
use crate::storage::engines::HashMapStorage;
use crate::storage::loader::BulkLoader;
use crate::storage::map_data_store::MapDataStore;
use crate::storage::scanner::PredicateScanner;
use crate::storage::worker::{BackgroundWorker, FlushRunnable};
use crate::traits::{BackingStore, StoreError};

/// Builds [`MapCache`] instances over a backing store.
pub struct MapCacheFactory<K: CacheKey, V: CacheValue> {
    config: CacheConfig,
    store: Arc<dyn BackingStore>,
    codec: EntryCodec<K, V>,
    engine: Option<Arc<dyn StorageEngine<K, V>>>,
    lifecycle: Arc<CacheLifecycle>,
}

impl<K: CacheKey, V: CacheValue> MapCacheFactory<K, V> {
    /// Uses the default codec for `K` and `V` (text for `String`, JSON
    /// otherwise) and a [`HashMapStorage`] engine.
    pub fn new(config: CacheConfig, store: Arc<dyn BackingStore>) -> Self {
        Self {
            config,
            store,
            codec: EntryCodec::default(),
            engine: None,
            lifecycle: Arc::new(CacheLifecycle::new()),
        }
    }

    /// Replaces the codec, e.g. to describe a key type as text.
    #[must_use]
    pub fn with_codec(mut self, codec: EntryCodec<K, V>) -> Self {
        self.codec = codec;
        self
    }

    /// Replaces the in-memory engine.
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn StorageEngine<K, V>>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Receiver that flips to `true` once the cache being built is ready.
    pub fn ready_receiver(&self) -> watch::Receiver<bool> {
        self.lifecycle.ready_receiver()
    }

    /// Initializes the store, runs the initial load, starts the flush worker,
    /// and signals readiness.
    ///
    /// # Errors
    ///
    /// Returns the store failure if initialization or the eager load fails.
    pub async fn build(self) -> Result<MapCache<K, V>, StoreError> {
        let instance_id = Uuid::new_v4();
        let config = self.config;
        info!(
            map = %config.map_name,
            instance = %instance_id,
            backend = self.store.name(),
            write_delay_ms = u64::try_from(config.write_delay.as_millis()).unwrap_or(u64::MAX),
            initial_load = ?config.initial_load,
            "starting cache"
        );

        let store: Arc<dyn BackingStore> =
            Arc::new(TimeoutStore::new(self.store, config.store_timeout));
        store.initialize().await?;

        let engine: Arc<dyn StorageEngine<K, V>> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(HashMapStorage::new()),
        };
        let data_store: Arc<dyn MapDataStore<K, V>> = Arc::new(WriteBehindDataStore::new(
            Arc::clone(&store),
            self.codec,
            &config,
        ));
        let loader = BulkLoader::new(
            config.map_name.clone(),
            Arc::clone(&engine),
            Arc::clone(&data_store),
        );
        let scanner = PredicateScanner::new(
            config.map_name.clone(),
            Arc::clone(&engine),
            config.scan_timeout,
        );

        if config.initial_load == InitialLoadMode::Eager {
            loader.load_all().await?;
        }

        let worker = BackgroundWorker::start(
            FlushRunnable::new(config.map_name.clone(), Arc::clone(&data_store)),
            config.flush_tick,
        );

        self.lifecycle.set_ready();
        info!(map = %config.map_name, instance = %instance_id, resident = engine.len(), "cache ready");

        Ok(MapCache::from_parts(CacheParts {
            instance_id,
            config,
            store,
            engine,
            data_store,
            loader,
            scanner,
            lifecycle: self.lifecycle,
            worker,
        }))
    }
}
