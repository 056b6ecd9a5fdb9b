//! [`BackingStore`](crate::traits::BackingStore) adapters.
//!
//! - [`PostgresStore`]: relational, with an optional ambient transaction
//! - [`RedbStore`]: embedded column-family style table
//! - [`InMemoryStore`]: process-local, for tests and ephemeral nodes
//!
//! [`TimeoutStore`] wraps any of them with a per-call deadline.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "redb")]
mod redb_store;
mod timeout;

pub use memory::{InMemoryStore, StoreOp};
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "redb")]
pub use redb_store::RedbStore;
pub use timeout::TimeoutStore;
