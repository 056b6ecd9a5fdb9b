//! `mapstore` node: write-behind cache over relational and column-family stores.
//!
//! A [`MapCache`] keeps every entry in memory and persists mutations to a
//! [`BackingStore`] after a configurable delay, coalescing repeated writes to
//! the same key. Build one with [`MapCacheFactory`](storage::MapCacheFactory).

pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod storage;
pub mod traits;

pub use cache::{CacheError, MapCache};
pub use config::{CacheConfig, InitialLoadMode, RetryPolicy};
pub use lifecycle::{CacheLifecycle, CacheState};
pub use storage::{MapCacheFactory, Provenance, Record, RecordMetadata};
pub use traits::{BackingStore, StoreError};
