//! Column-family [`BackingStore`] on an embedded redb database.
//!
//! One redb table of `id -> payload` strings stands in for the
//! `(id, data)` column family. Each call runs in its own transaction on the
//! blocking pool; there are no multi-row transactions and no versions.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use mapstore_core::DurableRecord;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::info;

use crate::traits::{BackingStore, StoreError};

const BACKEND: &str = "redb";

fn store_error(err: impl Into<redb::Error>) -> StoreError {
    match err.into() {
        redb::Error::Io(e) => StoreError::Unavailable {
            backend: BACKEND,
            reason: e.to_string(),
        },
        other => StoreError::Backend {
            backend: BACKEND,
            reason: other.to_string(),
        },
    }
}

/// redb-backed durable table.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    table: Arc<str>,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open (or create) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be opened or the table cannot
    /// be created.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(store_error)?;
        let store = Self::from_database(db, table)?;
        info!(
            backend = BACKEND,
            path = %path.display(),
            table,
            rows = store.row_count()?,
            "opened column-family store"
        );
        Ok(store)
    }

    /// Create a store that lives only in memory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the table cannot be created.
    pub fn in_memory(table: &str) -> Result<Self, StoreError> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(store_error)?;
        Self::from_database(db, table)
    }

    fn from_database(db: Database, table: &str) -> Result<Self, StoreError> {
        let wtx = db.begin_write().map_err(store_error)?;
        wtx.open_table(TableDefinition::<&str, &str>::new(table))
            .map_err(store_error)?;
        wtx.commit().map_err(store_error)?;
        Ok(Self {
            db: Arc::new(db),
            table: Arc::from(table),
        })
    }

    fn row_count(&self) -> Result<u64, StoreError> {
        let rtx = self.db.begin_read().map_err(store_error)?;
        let table = rtx
            .open_table(TableDefinition::<&str, &str>::new(&self.table))
            .map_err(store_error)?;
        table.len().map_err(store_error)
    }

    /// Runs `op` on the blocking pool with its own handle to the database.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database, TableDefinition<'_, &'static str, &'static str>) -> Result<T, StoreError>
            + Send
            + 'static,
    {
        let db = Arc::clone(&self.db);
        let table = Arc::clone(&self.table);
        tokio::task::spawn_blocking(move || op(&db, TableDefinition::new(&table)))
            .await
            .map_err(|e| StoreError::Backend {
                backend: BACKEND,
                reason: e.to_string(),
            })?
    }
}

#[async_trait]
impl BackingStore for RedbStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn persist(&self, id: &str, payload: &str) -> Result<(), StoreError> {
        let (id, payload) = (id.to_string(), payload.to_string());
        self.blocking(move |db, def| {
            let wtx = db.begin_write().map_err(store_error)?;
            wtx.open_table(def)
                .map_err(store_error)?
                .insert(id.as_str(), payload.as_str())
                .map_err(store_error)?;
            wtx.commit().map_err(store_error)
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.blocking(move |db, def| {
            let wtx = db.begin_write().map_err(store_error)?;
            wtx.open_table(def)
                .map_err(store_error)?
                .remove(id.as_str())
                .map_err(store_error)?;
            wtx.commit().map_err(store_error)
        })
        .await
    }

    async fn find(&self, id: &str) -> Result<Option<DurableRecord>, StoreError> {
        let id = id.to_string();
        self.blocking(move |db, def| {
            let rtx = db.begin_read().map_err(store_error)?;
            let table = rtx.open_table(def).map_err(store_error)?;
            let payload = table
                .get(id.as_str())
                .map_err(store_error)?
                .map(|v| v.value().to_string());
            Ok(payload.map(|payload| DurableRecord::new(id, payload)))
        })
        .await
    }

    async fn find_all(&self, ids: Option<&[String]>) -> Result<Vec<DurableRecord>, StoreError> {
        let ids = ids.map(<[String]>::to_vec);
        self.blocking(move |db, def| {
            let rtx = db.begin_read().map_err(store_error)?;
            let table = rtx.open_table(def).map_err(store_error)?;
            let mut records = Vec::new();
            match ids {
                None => {
                    for entry in table.iter().map_err(store_error)? {
                        let (id, payload) = entry.map_err(store_error)?;
                        records.push(DurableRecord::new(id.value(), payload.value()));
                    }
                }
                Some(ids) => {
                    for id in ids {
                        if let Some(payload) = table.get(id.as_str()).map_err(store_error)? {
                            records.push(DurableRecord::new(id.as_str(), payload.value()));
                        }
                    }
                }
            }
            Ok(records)
        })
        .await
    }
}
