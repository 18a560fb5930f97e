//! # Object Serialization
//!
//! Conversion of registered application objects to and from parcel payloads.
//!
//! ## Features
//! - **Multiple formats**: Bincode (default) and JSON, selectable per connection
//! - **Self-describing payloads**: every object carries its registered name and
//!   format byte, so peers with different default formats interoperate
//! - **Type registry**: only registered types can be sent or received
//!
//! ## Object Payload Layout
//! ```text
//! [NameLen(2)] [Name(N)] [Format(1)] [Body(M)]
//! ```
//!
//! ## Usage
//! ```rust
//! use parcel_net::core::serialization::{ObjectRegistry, SerializationFormat};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Hello { text: String }
//!
//! let registry = ObjectRegistry::new();
//! registry.register_as::<Hello>("hello").unwrap();
//!
//! let bytes = registry.serialize(&Hello { text: "hi".into() }, SerializationFormat::Json).unwrap();
//! let object = registry.deserialize(&bytes).unwrap();
//! assert_eq!(object.downcast_ref::<Hello>(), Some(&Hello { text: "hi".into() }));
//! ```

use crate::error::{constants, ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// Registered name of `String`
pub const STRING_TYPE: &str = "string";

/// Registered name of `Vec<u8>` byte blocks
pub const BYTES_TYPE: &str = "bytes";

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
}

impl SerializationFormat {
    /// Get the format identifier byte for wire protocol
    pub fn format_byte(self) -> u8 {
        match self {
            SerializationFormat::Bincode => 0x01,
            SerializationFormat::Json => 0x02,
        }
    }

    /// Detect format from identifier byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SerializationFormat::Bincode),
            0x02 => Some(SerializationFormat::Json),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
        }
    }
}

/// Serialize a value with the specified format
pub fn serialize_format<T: Serialize + ?Sized>(
    value: &T,
    format: SerializationFormat,
) -> Result<Vec<u8>> {
    match format {
        SerializationFormat::Bincode => {
            bincode::serialize(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
        }
        SerializationFormat::Json => {
            serde_json::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
        }
    }
}

/// Deserialize a value with the specified format
pub fn deserialize_format<T: DeserializeOwned>(
    data: &[u8],
    format: SerializationFormat,
) -> Result<T> {
    match format {
        SerializationFormat::Bincode => {
            bincode::deserialize(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
        }
        SerializationFormat::Json => {
            serde_json::from_slice(data).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
        }
    }
}

/// A deserialized object of some registered type
#[derive(Clone)]
pub struct ReceivedObject {
    type_name: Arc<str>,
    value: Arc<dyn Any + Send + Sync>,
}

impl ReceivedObject {
    /// Registered name of the object's type
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Borrow the object as `T` if that is its type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Shared handle to the object as `T` if that is its type
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// Whether the object is a `T`
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }
}

impl fmt::Debug for ReceivedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedObject")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

trait ErasedCodec: Send + Sync {
    fn decode(
        &self,
        body: &[u8],
        format: SerializationFormat,
    ) -> Result<Arc<dyn Any + Send + Sync>>;
}

struct TypedCodec<T>(PhantomData<fn() -> T>);

impl<T> ErasedCodec for TypedCodec<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn decode(
        &self,
        body: &[u8],
        format: SerializationFormat,
    ) -> Result<Arc<dyn Any + Send + Sync>> {
        let value: T = deserialize_format(body, format)?;
        Ok(Arc::new(value))
    }
}

#[derive(Default)]
struct RegistryInner {
    names: HashMap<TypeId, Arc<str>>,
    codecs: HashMap<Arc<str>, Arc<dyn ErasedCodec>>,
}

/// Registry of object types that may cross the wire
///
/// Cloning yields a handle to the same registry. Both peers must register a
/// type under the same name.
#[derive(Clone)]
pub struct ObjectRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ObjectRegistry {
    /// Registry with `String` and `Vec<u8>` pre-registered
    pub fn new() -> Self {
        let mut inner = RegistryInner::default();
        insert::<String>(&mut inner, STRING_TYPE);
        insert::<Vec<u8>>(&mut inner, BYTES_TYPE);
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    /// Register `T` under its Rust type name
    pub fn register<T>(&self) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register_as::<T>(std::any::type_name::<T>())
    }

    /// Register `T` under an explicit name, replacing any earlier binding of that name
    pub fn register_as<T>(&self, name: &str) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(ProtocolError::ConfigError(format!(
                "Invalid registration name length: {}",
                name.len()
            )));
        }
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
        insert::<T>(&mut inner, name);
        Ok(())
    }

    /// Whether `T` may be sent
    pub fn is_registered<T: 'static>(&self) -> bool {
        self.inner
            .read()
            .map(|inner| inner.names.contains_key(&TypeId::of::<T>()))
            .unwrap_or(false)
    }

    /// Names of all registered types
    pub fn registered_names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|inner| inner.codecs.keys().map(|k| k.to_string()).collect())
            .unwrap_or_default()
    }

    /// Encode a registered object into an object payload
    pub fn serialize<T>(&self, value: &T, format: SerializationFormat) -> Result<Vec<u8>>
    where
        T: Serialize + 'static,
    {
        let name = {
            let inner = self
                .inner
                .read()
                .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
            inner
                .names
                .get(&TypeId::of::<T>())
                .cloned()
                .ok_or_else(|| {
                    ProtocolError::UnregisteredObject(std::any::type_name::<T>().to_string())
                })?
        };

        let body = serialize_format(value, format)?;
        let mut out = Vec::with_capacity(2 + name.len() + 1 + body.len());
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(format.format_byte());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode an object payload into an object of its registered type
    pub fn deserialize(&self, data: &[u8]) -> Result<ReceivedObject> {
        if data.len() < 3 {
            return Err(ProtocolError::DeserializeError(
                "Object payload too short".to_string(),
            ));
        }
        let name_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let body_start = 2 + name_len + 1;
        if data.len() < body_start {
            return Err(ProtocolError::DeserializeError(
                "Object payload truncated in type name".to_string(),
            ));
        }
        let name = std::str::from_utf8(&data[2..2 + name_len])
            .map_err(|e| ProtocolError::DeserializeError(e.to_string()))?;
        let format_byte = data[2 + name_len];
        let format = SerializationFormat::from_byte(format_byte).ok_or_else(|| {
            ProtocolError::DeserializeError(format!("Unknown format byte: {format_byte}"))
        })?;

        let (type_name, codec) = {
            let inner = self
                .inner
                .read()
                .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
            inner
                .codecs
                .get_key_value(name)
                .map(|(k, v)| (Arc::clone(k), Arc::clone(v)))
                .ok_or_else(|| ProtocolError::UnregisteredObject(name.to_string()))?
        };

        let value = codec.decode(&data[body_start..], format)?;
        Ok(ReceivedObject { type_name, value })
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("types", &self.registered_names())
            .finish()
    }
}

fn insert<T>(inner: &mut RegistryInner, name: &str)
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let name: Arc<str> = Arc::from(name);
    if let Some(old) = inner.names.insert(TypeId::of::<T>(), Arc::clone(&name)) {
        if old != name {
            inner.codecs.remove(&old);
        }
    }
    inner
        .codecs
        .insert(name, Arc::new(TypedCodec::<T>(PhantomData)));
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_format_byte_roundtrip() {
        for format in [SerializationFormat::Bincode, SerializationFormat::Json] {
            let recovered =
                SerializationFormat::from_byte(format.format_byte()).expect("valid format byte");
            assert_eq!(format, recovered);
        }
        assert_eq!(SerializationFormat::from_byte(0x7F), None);
    }

    #[test]
    fn test_default_format() {
        assert_eq!(SerializationFormat::default(), SerializationFormat::Bincode);
        assert_eq!(SerializationFormat::Json.name(), "JSON");
    }

    #[test]
    fn test_unregistered_type_is_refused() {
        let registry = ObjectRegistry::new();
        let err = registry
            .serialize(&Point { x: 1, y: 2 }, SerializationFormat::Bincode)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnregisteredObject(_)));
        assert!(!registry.is_registered::<Point>());
    }

    #[test]
    fn test_registered_object_in_both_formats() {
        let registry = ObjectRegistry::new();
        registry.register_as::<Point>("point").unwrap();
        assert!(registry.is_registered::<Point>());

        for format in [SerializationFormat::Bincode, SerializationFormat::Json] {
            let bytes = registry.serialize(&Point { x: 3, y: -4 }, format).unwrap();
            let object = registry.deserialize(&bytes).unwrap();
            assert_eq!(object.type_name(), "point");
            assert_eq!(object.downcast_ref::<Point>(), Some(&Point { x: 3, y: -4 }));
        }
    }

    #[test]
    fn test_builtin_types() {
        let registry = ObjectRegistry::default();
        let bytes = registry
            .serialize(&"text".to_string(), SerializationFormat::Bincode)
            .unwrap();
        let object = registry.deserialize(&bytes).unwrap();
        assert!(object.is::<String>());
        assert_eq!(object.type_name(), STRING_TYPE);

        let block = registry
            .serialize(&vec![1u8, 2, 3], SerializationFormat::Json)
            .unwrap();
        let object = registry.deserialize(&block).unwrap();
        assert_eq!(object.downcast::<Vec<u8>>().as_deref(), Some(&vec![1u8, 2, 3]));
    }

    #[test]
    fn test_receiver_without_registration_refuses() {
        let sender = ObjectRegistry::new();
        sender.register_as::<Point>("point").unwrap();
        let bytes = sender.serialize(&Point { x: 0, y: 0 }, SerializationFormat::Bincode).unwrap();

        let receiver = ObjectRegistry::new();
        assert!(matches!(
            receiver.deserialize(&bytes),
            Err(ProtocolError::UnregisteredObject(name)) if name == "point"
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let registry = ObjectRegistry::new();
        assert!(registry.deserialize(&[0, 10, b'a']).is_err());
        assert!(registry.deserialize(&[]).is_err());
    }
}
