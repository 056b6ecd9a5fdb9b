//! Record types for the in-memory layer.
//!
//! Defines the unit stored in [`StorageEngine`](super::StorageEngine):
//! [`Record`] (shared value + metadata) and [`RecordMetadata`].

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
///
/// Millisecond timestamps fit comfortably in i64 until the year 292 million.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Where a resident record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Written through the cache facade.
    Client,
    /// Loaded from the backing store.
    Load,
}

/// Metadata tracked for every resident record.
///
/// Node-internal, never persisted.
#[derive(Debug, Clone)]
pub struct RecordMetadata {
    /// Record version, incremented on every update.
    pub version: u32,
    /// Wall-clock time (millis since epoch) when this record was created.
    pub creation_time: i64,
    /// Wall-clock time of the last write.
    pub last_update_time: i64,
    /// Origin of the current value.
    pub provenance: Provenance,
}

impl RecordMetadata {
    /// Creates metadata for a fresh record. Version starts at 1.
    #[must_use]
    pub fn new(now: i64, provenance: Provenance) -> Self {
        Self {
            version: 1,
            creation_time: now,
            last_update_time: now,
            provenance,
        }
    }

    /// Derives metadata for a client write over `self`: bumps `version` and
    /// `last_update_time`, keeps `creation_time`.
    #[must_use]
    pub fn updated(&self, now: i64) -> Self {
        Self {
            version: self.version.saturating_add(1),
            creation_time: self.creation_time,
            last_update_time: now,
            provenance: Provenance::Client,
        }
    }
}

/// A resident entry: immutable shared value plus metadata.
///
/// Values are behind `Arc` so readers, scans, and the flush task share one
/// fully-constructed allocation; a write swaps the `Arc`, never mutates it.
#[derive(Debug)]
pub struct Record<V> {
    /// The cached value.
    pub value: Arc<V>,
    /// Node-internal metadata.
    pub metadata: RecordMetadata,
}

impl<V> Record<V> {
    /// Creates a record with fresh metadata.
    #[must_use]
    pub fn new(value: Arc<V>, provenance: Provenance) -> Self {
        Self {
            value,
            metadata: RecordMetadata::new(now_millis(), provenance),
        }
    }
}

impl<V> Clone for Record<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            metadata: self.metadata.clone(),
        }
    }
}
