//! [`MapDataStore`](super::MapDataStore) implementations.

mod write_behind;

pub use write_behind::WriteBehindDataStore;
