//! Deadline enforcement for backing store calls.
//!
//! Wraps any [`BackingStore`] and bounds every call with `tokio::time::timeout`,
//! turning an elapsed deadline into [`StoreError::Timeout`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use mapstore_core::DurableRecord;

use crate::traits::{BackingStore, StoreError};

/// Store wrapper that enforces a per-call timeout.
#[derive(Debug, Clone)]
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: BackingStore> TimeoutStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(StoreError::Timeout {
                backend: self.inner.name(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[async_trait]
impl<S: BackingStore> BackingStore for TimeoutStore<S> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn persist(&self, id: &str, payload: &str) -> Result<(), StoreError> {
        self.bounded(self.inner.persist(id, payload)).await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.bounded(self.inner.remove(id)).await
    }

    async fn find(&self, id: &str) -> Result<Option<DurableRecord>, StoreError> {
        self.bounded(self.inner.find(id)).await
    }

    async fn find_all(&self, ids: Option<&[String]>) -> Result<Vec<DurableRecord>, StoreError> {
        self.bounded(self.inner.find_all(ids)).await
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.bounded(self.inner.initialize()).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.bounded(self.inner.close()).await
    }
}
