//! The persisted counterpart of a cache entry.

use serde::{Deserialize, Serialize};

/// A row in the backing store: text primary key plus text payload.
///
/// `id` is the encoded cache key and `payload` the encoded value. `version`
/// is only populated by adapters that keep an optimistic-concurrency counter
/// (the relational adapter); column-family adapters leave it `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    /// Encoded key. Unique within a table.
    pub id: String,
    /// Encoded value.
    pub payload: String,
    /// Monotonic row version, incremented on every upsert.
    pub version: Option<i64>,
}

impl DurableRecord {
    /// Creates an unversioned record.
    #[must_use]
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            version: None,
        }
    }

    /// Attaches a row version.
    #[must_use]
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }
}
