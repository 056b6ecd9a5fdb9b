use async_trait::async_trait;
use mapstore_core::{CodecError, DurableRecord};

/// Failure reported by a [`BackingStore`].
///
/// `Unavailable` and `Timeout` both mean the durable store could not be
/// reached; the write-behind coordinator retries them and the scanner degrades
/// to an empty result. `Backend` covers everything the store rejected outright,
/// and `Encode` an entry that never reached the store because the codec could
/// not express it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{backend} store unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("{backend} store call timed out after {timeout_ms}ms")]
    Timeout {
        backend: &'static str,
        timeout_ms: u64,
    },
    #[error("{backend} store error: {reason}")]
    Backend {
        backend: &'static str,
        reason: String,
    },
    #[error("entry cannot be encoded: {0}")]
    Encode(#[from] CodecError),
}

impl StoreError {
    /// Whether the error means the store could not be reached in time.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// Name of the backend that produced the error.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Unavailable { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::Backend { backend, .. } => backend,
            Self::Encode(_) => "codec",
        }
    }
}

/// Durable storage behind the cache: one table of `(id, payload)` rows.
///
/// Implementations: `PostgreSQL` (relational, transactional), redb
/// (column-family, row-atomic only), memory (tests and ephemeral nodes).
/// Every failure is returned to the caller; adapters never swallow errors.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Short backend name for logs and errors.
    fn name(&self) -> &'static str;

    /// Upsert a row. Overwrites an existing row with the same id.
    async fn persist(&self, id: &str, payload: &str) -> Result<(), StoreError>;

    /// Delete a row. Deleting a missing id is a no-op.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Load a single row, or `None` if absent.
    async fn find(&self, id: &str) -> Result<Option<DurableRecord>, StoreError>;

    /// Load rows in bulk.
    ///
    /// `None` returns the whole table; `Some(ids)` returns only rows whose id
    /// is listed. Missing ids are simply absent from the result.
    async fn find_all(&self, ids: Option<&[String]>) -> Result<Vec<DurableRecord>, StoreError>;

    /// One-time initialization (e.g., create the table).
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Release resources and close connections.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl<T: BackingStore + ?Sized> BackingStore for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn persist(&self, id: &str, payload: &str) -> Result<(), StoreError> {
        (**self).persist(id, payload).await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        (**self).remove(id).await
    }

    async fn find(&self, id: &str) -> Result<Option<DurableRecord>, StoreError> {
        (**self).find(id).await
    }

    async fn find_all(&self, ids: Option<&[String]>) -> Result<Vec<DurableRecord>, StoreError> {
        (**self).find_all(ids).await
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        (**self).initialize().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_and_timeout_classify_as_unavailable() {
        let down = StoreError::Unavailable {
            backend: "postgres",
            reason: "connection refused".to_string(),
        };
        let slow = StoreError::Timeout {
            backend: "redb",
            timeout_ms: 50,
        };
        let rejected = StoreError::Backend {
            backend: "postgres",
            reason: "syntax error".to_string(),
        };

        assert!(down.is_unavailable());
        assert!(slow.is_unavailable());
        assert!(!rejected.is_unavailable());
        assert_eq!(slow.backend(), "redb");
        assert_eq!(slow.to_string(), "redb store call timed out after 50ms");
    }
}
