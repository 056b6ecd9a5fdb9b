//! Relational [`BackingStore`] on `PostgreSQL`.
//!
//! Rows are `(id TEXT PRIMARY KEY, payload TEXT, version BIGINT)`; each upsert
//! bumps `version`. Calls run on the pool unless an ambient transaction was
//! opened with [`PostgresStore::begin`], in which case they join it until
//! [`commit`](PostgresStore::commit) or [`rollback`](PostgresStore::rollback).

use std::time::Duration;

use async_trait::async_trait;
use mapstore_core::DurableRecord;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::traits::{BackingStore, StoreError};

const BACKEND: &str = "postgres";

type Row = (String, String, i64);

fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => StoreError::Unavailable {
            backend: BACKEND,
            reason: err.to_string(),
        },
        other => StoreError::Backend {
            backend: BACKEND,
            reason: other.to_string(),
        },
    }
}

fn to_record((id, payload, version): Row) -> DurableRecord {
    DurableRecord::new(id, payload).with_version(version)
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && table.len() <= 63;
    if valid {
        Ok(())
    } else {
        Err(StoreError::Backend {
            backend: BACKEND,
            reason: format!("invalid table name {table:?}"),
        })
    }
}

/// `SELECT ... WHERE id = $1 OR id = $2 ...` over the given ids.
fn find_by_ids<'a>(table: &str, ids: &'a [String]) -> QueryBuilder<'a, Postgres> {
    let mut query = QueryBuilder::new(format!("SELECT id, payload, version FROM {table} WHERE "));
    let mut disjunction = query.separated(" OR ");
    for id in ids {
        disjunction.push("id = ");
        disjunction.push_bind_unseparated(id.as_str());
    }
    query
}

/// Ids bound per lookup query. Postgres caps a statement at 65535 bind
/// parameters; long id lists are split into several queries.
const MAX_IDS_PER_QUERY: usize = 1000;

fn find_by_id_batches<'a>(table: &str, ids: &'a [String]) -> Vec<QueryBuilder<'a, Postgres>> {
    ids.chunks(MAX_IDS_PER_QUERY)
        .map(|batch| find_by_ids(table, batch))
        .collect()
}

struct Statements {
    create: String,
    upsert: String,
    delete: String,
    select_one: String,
    select_all: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id TEXT PRIMARY KEY, \
                 payload TEXT NOT NULL, \
                 version BIGINT NOT NULL DEFAULT 0)"
            ),
            upsert: format!(
                "INSERT INTO {table} (id, payload) VALUES ($1, $2) \
                 ON CONFLICT (id) DO UPDATE \
                 SET payload = EXCLUDED.payload, version = {table}.version + 1"
            ),
            delete: format!("DELETE FROM {table} WHERE id = $1"),
            select_one: format!("SELECT id, payload, version FROM {table} WHERE id = $1"),
            select_all: format!("SELECT id, payload, version FROM {table}"),
        }
    }
}

/// `PostgreSQL`-backed durable table.
pub struct PostgresStore {
    pool: PgPool,
    table: String,
    sql: Statements,
    ambient: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Connects a pool to `url`. Call [`initialize`](BackingStore::initialize)
    /// afterwards to create the table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the URL is malformed, the table name is not a
    /// plain identifier, or the database cannot be reached.
    pub async fn connect(
        url: &str,
        table: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        validate_table(table)?;
        let options: PgConnectOptions = url.parse().map_err(store_error)?;
        info!(
            backend = BACKEND,
            host = options.get_host(),
            port = options.get_port(),
            database = options.get_database().unwrap_or_default(),
            table,
            "connecting relational store"
        );
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await
            .map_err(store_error)?;
        Self::with_pool(pool, table)
    }

    /// Wraps an existing pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if `table` is not a plain identifier.
    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self, StoreError> {
        validate_table(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            sql: Statements::new(table),
            ambient: Mutex::new(None),
        })
    }

    /// Opens the ambient transaction. Subsequent calls join it.
    ///
    /// # Errors
    ///
    /// Fails if a transaction is already open or one cannot be started.
    pub async fn begin(&self) -> Result<(), StoreError> {
        let mut ambient = self.ambient.lock().await;
        if ambient.is_some() {
            return Err(StoreError::Backend {
                backend: BACKEND,
                reason: "transaction already open".to_string(),
            });
        }
        *ambient = Some(self.pool.begin().await.map_err(store_error)?);
        debug!(backend = BACKEND, table = %self.table, "transaction opened");
        Ok(())
    }

    /// Commits the ambient transaction. A no-op when none is open.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails.
    pub async fn commit(&self) -> Result<(), StoreError> {
        let tx = self.ambient.lock().await.take();
        if let Some(tx) = tx {
            tx.commit().await.map_err(store_error)?;
            debug!(backend = BACKEND, table = %self.table, "transaction committed");
        }
        Ok(())
    }

    /// Rolls back the ambient transaction. A no-op when none is open.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the rollback fails.
    pub async fn rollback(&self) -> Result<(), StoreError> {
        let tx = self.ambient.lock().await.take();
        if let Some(tx) = tx {
            tx.rollback().await.map_err(store_error)?;
            debug!(backend = BACKEND, table = %self.table, "transaction rolled back");
        }
        Ok(())
    }
}

impl PostgresStore {
    async fn fetch_all(
        &self,
        mut builder: QueryBuilder<'_, Postgres>,
    ) -> Result<Vec<DurableRecord>, StoreError> {
        let query = builder.build_query_as::<Row>();
        let mut ambient = self.ambient.lock().await;
        if let Some(tx) = ambient.as_mut() {
            let rows = query.fetch_all(&mut **tx).await.map_err(store_error)?;
            return Ok(rows.into_iter().map(to_record).collect());
        }
        drop(ambient);
        let rows = query.fetch_all(&self.pool).await.map_err(store_error)?;
        Ok(rows.into_iter().map(to_record).collect())
    }
}

#[async_trait]
impl BackingStore for PostgresStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(&self.sql.create)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn persist(&self, id: &str, payload: &str) -> Result<(), StoreError> {
        let query = sqlx::query(&self.sql.upsert).bind(id).bind(payload);
        let mut ambient = self.ambient.lock().await;
        if let Some(tx) = ambient.as_mut() {
            query.execute(&mut **tx).await.map_err(store_error)?;
            return Ok(());
        }
        drop(ambient);
        query.execute(&self.pool).await.map_err(store_error)?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let query = sqlx::query(&self.sql.delete).bind(id);
        let mut ambient = self.ambient.lock().await;
        if let Some(tx) = ambient.as_mut() {
            query.execute(&mut **tx).await.map_err(store_error)?;
            return Ok(());
        }
        drop(ambient);
        query.execute(&self.pool).await.map_err(store_error)?;
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<DurableRecord>, StoreError> {
        let query = sqlx::query_as::<_, Row>(&self.sql.select_one).bind(id);
        let mut ambient = self.ambient.lock().await;
        if let Some(tx) = ambient.as_mut() {
            let row = query.fetch_optional(&mut **tx).await.map_err(store_error)?;
            return Ok(row.map(to_record));
        }
        drop(ambient);
        let row = query.fetch_optional(&self.pool).await.map_err(store_error)?;
        Ok(row.map(to_record))
    }

    async fn find_all(&self, ids: Option<&[String]>) -> Result<Vec<DurableRecord>, StoreError> {
        let Some(ids) = ids else {
            return self
                .fetch_all(QueryBuilder::new(self.sql.select_all.as_str()))
                .await;
        };
        let mut records = Vec::with_capacity(ids.len());
        for builder in find_by_id_batches(&self.table, ids) {
            records.extend(self.fetch_all(builder).await?);
        }
        Ok(records)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.rollback().await?;
        self.pool.close().await;
        info!(backend = BACKEND, table = %self.table, "relational store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_id_lists_are_split_across_queries() {
        let ids: Vec<String> = (0..2500).map(|i| format!("k{i}")).collect();
        let batches = find_by_id_batches("users", &ids);
        assert_eq!(batches.len(), 3);
        assert!(batches[0].sql().ends_with("OR id = $1000"));
        assert!(batches[2].sql().ends_with("OR id = $500"));

        assert!(find_by_id_batches("users", &[]).is_empty());
    }

    #[test]
    fn find_by_ids_builds_disjunction() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let query = find_by_ids("users", &ids);
        assert_eq!(
            query.sql(),
            "SELECT id, payload, version FROM users WHERE id = $1 OR id = $2 OR id = $3"
        );
    }

    #[test]
    fn table_names_must_be_identifiers() {
        assert!(validate_table("users").is_ok());
        assert!(validate_table("_cache_2").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("2users").is_err());
        assert!(validate_table("users; DROP TABLE x").is_err());
    }

    #[test]
    fn upsert_bumps_version() {
        let sql = Statements::new("users");
        assert!(sql.upsert.contains("ON CONFLICT (id) DO UPDATE"));
        assert!(sql.upsert.contains("version = users.version + 1"));
    }

    /// Live tests run only when `MAPSTORE_TEST_PG_URL` points at a database.
    async fn live_store(table: &str) -> Option<PostgresStore> {
        let url = std::env::var("MAPSTORE_TEST_PG_URL").ok()?;
        let store = PostgresStore::connect(&url, table, 2, Duration::from_secs(5))
            .await
            .unwrap();
        store.initialize().await.unwrap();
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&store.pool)
            .await
            .unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn live_persist_find_remove() {
        let Some(store) = live_store("mapstore_test_rows").await else {
            return;
        };

        store.persist("a", "1").await.unwrap();
        store.persist("a", "2").await.unwrap();
        let row = store.find("a").await.unwrap().unwrap();
        assert_eq!(row.payload, "2");
        assert_eq!(row.version, Some(1));

        store.persist("b", "3").await.unwrap();
        let ids = vec!["a".to_string(), "b".to_string(), "x".to_string()];
        assert_eq!(store.find_all(Some(&ids)).await.unwrap().len(), 2);
        assert_eq!(store.find_all(None).await.unwrap().len(), 2);

        store.remove("a").await.unwrap();
        assert!(store.find("a").await.unwrap().is_none());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn live_rollback_discards_writes() {
        let Some(store) = live_store("mapstore_test_tx").await else {
            return;
        };

        store.begin().await.unwrap();
        store.persist("a", "1").await.unwrap();
        assert!(store.find("a").await.unwrap().is_some());
        store.rollback().await.unwrap();
        assert!(store.find("a").await.unwrap().is_none());

        store.begin().await.unwrap();
        store.persist("b", "2").await.unwrap();
        store.commit().await.unwrap();
        assert!(store.find("b").await.unwrap().is_some());
        store.close().await.unwrap();
    }
}
