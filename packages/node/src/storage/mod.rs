//! Layered storage for the cache.
//!
//! - **Layer 1** ([`StorageEngine`]): resident entries in memory
//! - **Layer 2** ([`MapDataStore`]): write-behind persistence of mutations
//! - **Layer 3** ([`BackingStore`](crate::traits::BackingStore)): the durable
//!   table, reached through one of the [`backends`]
//!
//! [`BulkLoader`] moves data from layer 3 into layer 1 and
//! [`PredicateScanner`] queries layer 1.

pub mod backends;
pub mod datastores;
pub mod engine;
pub mod engines;
pub mod factory;
pub mod loader;
pub mod map_data_store;
pub mod record;
pub mod scanner;
pub mod worker;

pub use engine::*;
pub use factory::MapCacheFactory;
pub use loader::{BulkLoader, LoadReport};
pub use map_data_store::*;
pub use record::*;
pub use scanner::PredicateScanner;
