use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bounds required of a cache key.
///
/// Keys live in the in-memory map (hence `Eq + Hash`), travel to the flush
/// task (hence `Send + Sync + 'static`), and are written to the backing store's
/// text primary key column through the [`EntryCodec`](crate::EntryCodec).
pub trait CacheKey:
    Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds required of a cached value.
///
/// Values are shared as `Arc<V>` between readers, scans, and the flush task,
/// so they never need to be `Clone`.
pub trait CacheValue: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}
