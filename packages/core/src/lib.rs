//! `mapstore` core: entry codec, durable record shape, and value predicates.
//!
//! Nothing in this crate touches a runtime or a backing store. The node crate
//! (`mapstore-node`) builds the write-behind cache on top of these pieces.

pub mod codec;
pub mod predicate;
pub mod record;
pub mod types;

pub use codec::{CodecError, EntryCodec, Format, TypeDescriptor};
pub use predicate::{FieldEquals, ValuePredicate};
pub use record::DurableRecord;
pub use types::{CacheKey, CacheValue};
