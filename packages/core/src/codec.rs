//! Entry codec: converts cache keys and values to and from durable text.
//!
//! The backing store keeps every entry as a text primary key plus a text
//! payload. [`EntryCodec`] owns that mapping for one `(K, V)` pair:
//!
//! - Types described with [`Format::Text`] are stored as-is, without quoting.
//!   `String` keys and values always use this format, so the primary key column
//!   holds the key verbatim rather than a JSON string literal.
//! - Everything else is stored as its JSON document ([`Format::Json`]).
//!
//! Generic and parameterized types (`Vec<User>`, `Envelope<Order>`, ...) need no
//! runtime introspection: the caller names the concrete type in the
//! [`TypeDescriptor`] handed to the codec at construction time, and decoding is
//! driven entirely by that descriptor.

use std::any::{type_name, TypeId};
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::record::DurableRecord;

/// Failure converting between an in-memory type and its durable text.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {type_name}: {source}")]
    Encode {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {type_name} from durable text: {source}")]
    Decode {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{type_name} is described as text but does not serialize to a string")]
    NotText { type_name: &'static str },
}

/// Durable representation chosen for a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// The durable text is the value itself.
    Text,
    /// The durable text is the JSON document of the value.
    Json,
}

/// Caller-supplied description of a key or value type.
///
/// Carries the durable [`Format`] and the type's name for diagnostics. The type
/// itself is fixed by the parameter `T`, which is what lets parameterized types
/// decode without any erased-generics workarounds.
pub struct TypeDescriptor<T: ?Sized> {
    format: Format,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ?Sized> TypeDescriptor<T> {
    /// Describes `T` as a JSON document.
    #[must_use]
    pub fn json() -> Self {
        Self {
            format: Format::Json,
            name: type_name::<T>(),
            _marker: PhantomData,
        }
    }

    /// Describes `T` as plain text.
    ///
    /// Valid for any type that serializes to a single string (`String`,
    /// string newtypes, unit-only enums). Anything else fails at encode time
    /// with [`CodecError::NotText`].
    #[must_use]
    pub fn text() -> Self {
        Self {
            format: Format::Text,
            name: type_name::<T>(),
            _marker: PhantomData,
        }
    }

    /// The durable format of this type.
    #[must_use]
    pub fn format(&self) -> Format {
        self.format
    }

    /// The Rust type name, used in log fields and error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.name
    }
}

impl<T: ?Sized + 'static> TypeDescriptor<T> {
    /// Text for `String`, JSON for everything else.
    #[must_use]
    pub fn of() -> Self {
        if TypeId::of::<T>() == TypeId::of::<String>() {
            Self::text()
        } else {
            Self::json()
        }
    }
}

impl<T: ?Sized> Clone for TypeDescriptor<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for TypeDescriptor<T> {}

impl<T: ?Sized> fmt::Debug for TypeDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("format", &self.format)
            .field("type", &self.name)
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned> TypeDescriptor<T> {
    fn encode(&self, value: &T) -> Result<String, CodecError> {
        match self.format {
            Format::Json => serde_json::to_string(value).map_err(|source| CodecError::Encode {
                type_name: self.name,
                source,
            }),
            Format::Text => match serde_json::to_value(value) {
                Ok(serde_json::Value::String(text)) => Ok(text),
                Ok(_) => Err(CodecError::NotText {
                    type_name: self.name,
                }),
                Err(source) => Err(CodecError::Encode {
                    type_name: self.name,
                    source,
                }),
            },
        }
    }

    fn decode(&self, text: &str) -> Result<T, CodecError> {
        let decoded = match self.format {
            Format::Json => serde_json::from_str(text),
            Format::Text => serde_json::from_value(serde_json::Value::String(text.to_owned())),
        };
        decoded.map_err(|source| CodecError::Decode {
            type_name: self.name,
            source,
        })
    }
}

/// Converts `(K, V)` entries to and from their durable text form.
pub struct EntryCodec<K, V> {
    key: TypeDescriptor<K>,
    value: TypeDescriptor<V>,
}

impl<K, V> EntryCodec<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    /// Creates a codec from explicit key and value descriptors.
    #[must_use]
    pub fn new(key: TypeDescriptor<K>, value: TypeDescriptor<V>) -> Self {
        Self { key, value }
    }

    /// Descriptor used for keys.
    #[must_use]
    pub fn key_descriptor(&self) -> TypeDescriptor<K> {
        self.key
    }

    /// Descriptor used for values.
    #[must_use]
    pub fn value_descriptor(&self) -> TypeDescriptor<V> {
        self.value
    }

    /// Encodes a key into the backing store's primary key text.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the key cannot be serialized in its format.
    pub fn encode_key(&self, key: &K) -> Result<String, CodecError> {
        self.key.encode(key)
    }

    /// Decodes a primary key back into a key.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] on malformed text.
    pub fn try_decode_key(&self, text: &str) -> Result<K, CodecError> {
        self.key.decode(text)
    }

    /// Encodes a value into its durable payload.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the value cannot be serialized in its format.
    pub fn encode_value(&self, value: &V) -> Result<String, CodecError> {
        self.value.encode(value)
    }

    /// Decodes a payload back into a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] on malformed text.
    pub fn try_decode_value(&self, text: &str) -> Result<V, CodecError> {
        self.value.decode(text)
    }

    /// Decodes a payload, logging and discarding malformed text.
    pub fn decode_value(&self, text: &str) -> Option<V> {
        match self.value.decode(text) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, "discarding undecodable payload");
                None
            }
        }
    }

    /// Decodes both halves of a durable record.
    ///
    /// Returns `None` (after logging) if either the id or the payload is
    /// malformed; callers skip such records.
    pub fn decode_record(&self, record: &DurableRecord) -> Option<(K, V)> {
        let key = match self.key.decode(&record.id) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(id = %record.id, error = %err, "discarding record with undecodable id");
                return None;
            }
        };
        match self.value.decode(&record.payload) {
            Ok(value) => Some((key, value)),
            Err(err) => {
                tracing::warn!(id = %record.id, error = %err, "discarding record with undecodable payload");
                None
            }
        }
    }
}

impl<K, V> Default for EntryCodec<K, V>
where
    K: Serialize + DeserializeOwned + 'static,
    V: Serialize + DeserializeOwned + 'static,
{
    fn default() -> Self {
        Self::new(TypeDescriptor::of(), TypeDescriptor::of())
    }
}

impl<K, V> Clone for EntryCodec<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            value: self.value,
        }
    }
}

impl<K, V> fmt::Debug for EntryCodec<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryCodec")
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}
