//! Population of the in-memory engine from the backing store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mapstore_core::{CacheKey, CacheValue};
use tracing::{debug, info};

use crate::storage::engine::StorageEngine;
use crate::storage::map_data_store::{LoadTicket, MapDataStore};
use crate::storage::record::{Provenance, Record};
use crate::traits::StoreError;

/// Counts from one load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Entries inserted into memory.
    pub loaded: u64,
    /// Rows that could not be decoded.
    pub skipped: u64,
    /// Rows ignored because memory already held the key or a write was pending.
    pub shadowed: u64,
    pub elapsed: Duration,
}

/// Moves durable rows into the engine without clobbering newer writes.
///
/// A ticket is taken before the store is read. A row is only inserted when
/// the key is absent from memory, has no pending write, and had no write
/// settle since the ticket was taken. All three checks happen under the key's
/// engine lock, so a load never resurrects a key removed while it ran, even
/// when the delete reached the store before the read returned.
pub struct BulkLoader<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    map_name: String,
    engine: Arc<dyn StorageEngine<K, V>>,
    data_store: Arc<dyn MapDataStore<K, V>>,
}

impl<K: CacheKey, V: CacheValue> BulkLoader<K, V> {
    pub fn new(
        map_name: impl Into<String>,
        engine: Arc<dyn StorageEngine<K, V>>,
        data_store: Arc<dyn MapDataStore<K, V>>,
    ) -> Self {
        Self {
            map_name: map_name.into(),
            engine,
            data_store,
        }
    }

    fn admit(&self, key: K, value: Arc<V>, ticket: &LoadTicket) -> bool {
        let data_store = &self.data_store;
        let candidate = key.clone();
        let mut value = Some(value);
        self.engine.insert_if_absent(key, &mut || {
            if data_store.admits_load(&candidate, ticket) {
                value.take().map(|value| Record::new(value, Provenance::Load))
            } else {
                None
            }
        })
    }

    fn insert_all(
        &self,
        entries: Vec<(K, V)>,
        skipped: u64,
        ticket: &LoadTicket,
        started: Instant,
    ) -> LoadReport {
        let mut report = LoadReport {
            skipped,
            ..LoadReport::default()
        };
        for (key, value) in entries {
            if self.admit(key, Arc::new(value), ticket) {
                report.loaded += 1;
            } else {
                report.shadowed += 1;
            }
        }
        report.elapsed = started.elapsed();
        report
    }

    /// Loads every durable row.
    ///
    /// # Errors
    ///
    /// Returns the store failure; memory is left with whatever was resident.
    pub async fn load_all(&self) -> Result<LoadReport, StoreError> {
        let started = Instant::now();
        let ticket = self.data_store.begin_load();
        let (entries, skipped) = self.data_store.load_all(None).await?;
        let report = self.insert_all(entries, skipped, &ticket, started);
        info!(
            map = %self.map_name,
            loaded = report.loaded,
            skipped = report.skipped,
            shadowed = report.shadowed,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "initial load complete"
        );
        Ok(report)
    }

    /// Loads the listed keys.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn load_keys(&self, keys: &[K]) -> Result<LoadReport, StoreError> {
        let started = Instant::now();
        if keys.is_empty() {
            return Ok(LoadReport::default());
        }
        let ticket = self.data_store.begin_load();
        let (entries, skipped) = self.data_store.load_all(Some(keys)).await?;
        let report = self.insert_all(entries, skipped, &ticket, started);
        debug!(map = %self.map_name, requested = keys.len(), loaded = report.loaded, "keys loaded");
        Ok(report)
    }

    /// Loads a single key and returns the resident value afterwards.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn load_one(&self, key: K) -> Result<Option<Arc<V>>, StoreError> {
        if self.data_store.has_pending_write(&key) {
            return Ok(self.engine.get(&key).map(|record| record.value));
        }
        let ticket = self.data_store.begin_load();
        match self.data_store.load(&key).await? {
            Some(value) => {
                let value = Arc::new(value);
                if self.admit(key.clone(), Arc::clone(&value), &ticket) {
                    return Ok(Some(value));
                }
                Ok(self.engine.get(&key).map(|record| record.value))
            }
            None => Ok(self.engine.get(&key).map(|record| record.value)),
        }
    }

    /// Keys present in the backing store, decoded.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn load_all_keys(&self) -> Result<Vec<K>, StoreError> {
        let (entries, _) = self.data_store.load_all(None).await?;
        Ok(entries.into_iter().map(|(key, _)| key).collect())
    }
}
