//! In-process [`BackingStore`] for tests and ephemeral nodes.
//!
//! Rows live in a `DashMap` and survive as long as the store value does, so a
//! test can tear down one cache and build another over the same store to
//! simulate a cold restart. Availability can be toggled to exercise retry and
//! degradation paths, and every successful write is journaled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mapstore_core::DurableRecord;
use parking_lot::Mutex;

use crate::traits::{BackingStore, StoreError};

const BACKEND: &str = "memory";

/// A write observed by an [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Persist { id: String, payload: String },
    Remove { id: String },
}

/// `DashMap`-backed durable table.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: DashMap<String, (String, i64)>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    read_delay: Mutex<Option<Duration>>,
    journal: Mutex<Vec<StoreOp>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a raw row without journaling it.
    pub fn seed(&self, id: impl Into<String>, payload: impl Into<String>) {
        self.rows.insert(id.into(), (payload.into(), 0));
    }

    /// While `false`, every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Adds an artificial delay before every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Holds reads back for `delay` after the rows were read, so the caller
    /// receives them late, as from a slow connection.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    /// Successful writes, in the order they were applied.
    #[must_use]
    pub fn journal(&self) -> Vec<StoreOp> {
        self.journal.lock().clone()
    }

    /// Number of successful writes that touched `id`.
    #[must_use]
    pub fn writes_for(&self, id: &str) -> usize {
        self.journal
            .lock()
            .iter()
            .filter(|op| match op {
                StoreOp::Persist { id: op_id, .. } | StoreOp::Remove { id: op_id } => op_id == id,
            })
            .count()
    }

    /// Current payload stored under `id`.
    #[must_use]
    pub fn payload(&self, id: &str) -> Option<String> {
        self.rows.get(id).map(|row| row.0.clone())
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                backend: BACKEND,
                reason: "store marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn deliver<T>(&self, rows: T) -> T {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        rows
    }

    fn to_record(id: &str, row: &(String, i64)) -> DurableRecord {
        DurableRecord::new(id, row.0.clone()).with_version(row.1)
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn persist(&self, id: &str, payload: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.rows
            .entry(id.to_string())
            .and_modify(|row| {
                row.0 = payload.to_string();
                row.1 += 1;
            })
            .or_insert_with(|| (payload.to_string(), 0));
        self.journal.lock().push(StoreOp::Persist {
            id: id.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.rows.remove(id);
        self.journal.lock().push(StoreOp::Remove { id: id.to_string() });
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<DurableRecord>, StoreError> {
        self.enter().await?;
        let record = self.rows.get(id).map(|row| Self::to_record(id, &row));
        Ok(self.deliver(record).await)
    }

    async fn find_all(&self, ids: Option<&[String]>) -> Result<Vec<DurableRecord>, StoreError> {
        self.enter().await?;
        let records = match ids {
            None => self
                .rows
                .iter()
                .map(|row| Self::to_record(row.key(), row.value()))
                .collect(),
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.rows.get(id).map(|row| Self::to_record(id, &row)))
                .collect(),
        };
        Ok(self.deliver(records).await)
    }
}
