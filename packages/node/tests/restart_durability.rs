//! Cold-restart durability: entries written through one cache instance are
//! served by a fresh instance built over the same backing store.

use std::sync::Arc;
use std::time::Duration;

use mapstore_node::storage::backends::InMemoryStore;
use mapstore_node::{BackingStore, CacheConfig, MapCache, MapCacheFactory};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    first: String,
}

fn ana() -> User {
    User {
        first: "Ana".to_string(),
    }
}

async fn start(store: Arc<dyn BackingStore>) -> MapCache<String, User> {
    MapCacheFactory::new(CacheConfig::new("users"), store)
        .build()
        .await
        .expect("cache starts")
}

#[tokio::test(start_paused = true)]
async fn flushed_entry_survives_restart() {
    let store = Arc::new(InMemoryStore::new());

    let first = start(store.clone()).await;
    first.put("u1".to_string(), ana()).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    // Dropped without shutdown: only what the write-behind path flushed remains.
    drop(first);

    let second = start(store).await;
    assert_eq!(second.get(&"u1".to_string()).await.as_deref(), Some(&ana()));
}

#[tokio::test(start_paused = true)]
async fn shutdown_persists_entries_still_inside_the_delay() {
    let store = Arc::new(InMemoryStore::new());

    let first = start(store.clone()).await;
    first.put("u1".to_string(), ana()).unwrap();
    first.put("u2".to_string(), ana()).unwrap();
    first.remove(&"u2".to_string()).unwrap();
    first.shutdown().await.unwrap();

    let second = start(store).await;
    assert_eq!(second.keys(), vec!["u1".to_string()]);
}

#[cfg(feature = "redb")]
#[tokio::test]
async fn redb_file_survives_restart() {
    use mapstore_node::storage::backends::RedbStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.redb");

    {
        let store = Arc::new(RedbStore::open(&path, "users").unwrap());
        let config = CacheConfig::new("users").with_write_delay(Duration::from_millis(20));
        let cache: MapCache<String, User> = MapCacheFactory::new(config, store)
            .build()
            .await
            .unwrap();
        cache.put("u1".to_string(), ana()).unwrap();
        cache.shutdown().await.unwrap();
    }

    let store = Arc::new(RedbStore::open(&path, "users").unwrap());
    let cache = start(store).await;
    assert_eq!(cache.get(&"u1".to_string()).await.as_deref(), Some(&ana()));
    let keys = cache.scan_by_value(&|u: &User| u.first == "Ana").await;
    assert_eq!(keys.len(), 1);
}
