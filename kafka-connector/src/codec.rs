//! Key/value codecs and the registry resolving them from configured names.
//!
//! Names follow the Kafka client conventions
//! (`org.apache.kafka.common.serialization.StringDeserializer`, ...) and
//! short aliases (`string`, `integer`, `long`, `bytes`, `json`), so the same
//! configuration keys work for the source deserializer and the dead-letter
//! serializers.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, WiringError};

const KAFKA_SERIALIZATION: &str = "org.apache.kafka.common.serialization";

pub trait Codec<T>: Send + Sync {
    fn serialize(&self, topic: &str, value: &T) -> Result<Vec<u8>, CodecError>;
    fn deserialize(&self, topic: &str, bytes: &[u8]) -> Result<T, CodecError>;
}

pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn serialize(&self, _topic: &str, value: &String) -> Result<Vec<u8>, CodecError> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, topic: &str, bytes: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Deserialize {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Big-endian 4 byte integers, wire compatible with the Kafka `IntegerSerializer`.
pub struct IntegerCodec;

impl Codec<i32> for IntegerCodec {
    fn serialize(&self, _topic: &str, value: &i32) -> Result<Vec<u8>, CodecError> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn deserialize(&self, topic: &str, bytes: &[u8]) -> Result<i32, CodecError> {
        let raw: [u8; 4] = bytes.try_into().map_err(|_| CodecError::Deserialize {
            topic: topic.to_string(),
            reason: format!("size of data received is {} instead of 4", bytes.len()),
        })?;
        Ok(i32::from_be_bytes(raw))
    }
}

/// Big-endian 8 byte integers, wire compatible with the Kafka `LongSerializer`.
pub struct LongCodec;

impl Codec<i64> for LongCodec {
    fn serialize(&self, _topic: &str, value: &i64) -> Result<Vec<u8>, CodecError> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn deserialize(&self, topic: &str, bytes: &[u8]) -> Result<i64, CodecError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| CodecError::Deserialize {
            topic: topic.to_string(),
            reason: format!("size of data received is {} instead of 8", bytes.len()),
        })?;
        Ok(i64::from_be_bytes(raw))
    }
}

pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn serialize(&self, _topic: &str, value: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(value.clone())
    }

    fn deserialize(&self, _topic: &str, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, topic: &str, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Serialize {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }

    fn deserialize(&self, topic: &str, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }
}

struct CodecEntry<T> {
    alias: String,
    serializer: String,
    deserializer: String,
    codec: Arc<dyn Codec<T>>,
}

impl<T> CodecEntry<T> {
    fn matches(&self, name: &str) -> bool {
        self.alias == name || self.serializer == name || self.deserializer == name
    }
}

/// Maps configured serializer/deserializer names to codecs for one Rust type.
pub struct CodecRegistry<T> {
    entries: Vec<CodecEntry<T>>,
}

impl<T> Default for CodecRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> Clone for CodecRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|e| CodecEntry {
                    alias: e.alias.clone(),
                    serializer: e.serializer.clone(),
                    deserializer: e.deserializer.clone(),
                    codec: e.codec.clone(),
                })
                .collect(),
        }
    }
}

impl<T> CodecRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a codec under a short alias and its serializer/deserializer
    /// names. Later registrations win over earlier ones.
    pub fn register(
        mut self,
        alias: &str,
        serializer: &str,
        deserializer: &str,
        codec: Arc<dyn Codec<T>>,
    ) -> Self {
        self.entries.insert(
            0,
            CodecEntry {
                alias: alias.to_string(),
                serializer: serializer.to_string(),
                deserializer: deserializer.to_string(),
                codec,
            },
        );
        self
    }

    /// Registers a codec under the Kafka class names `<prefix>Serializer` /
    /// `<prefix>Deserializer`.
    fn register_kafka(self, alias: &str, prefix: &str, codec: Arc<dyn Codec<T>>) -> Self {
        self.register(
            alias,
            &format!("{KAFKA_SERIALIZATION}.{prefix}Serializer"),
            &format!("{KAFKA_SERIALIZATION}.{prefix}Deserializer"),
            codec,
        )
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Codec<T>>, WiringError> {
        self.entries
            .iter()
            .find(|e| e.matches(name))
            .map(|e| e.codec.clone())
            .ok_or_else(|| WiringError::UnknownCodec(name.to_string()))
    }

    /// The serializer name paired with a deserializer name, used to pick the
    /// dead-letter serializer matching the source channel.
    pub fn serializer_for(&self, deserializer: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.matches(deserializer))
            .map(|e| e.serializer.as_str())
    }
}

/// Types with a built-in set of codecs.
pub trait DefaultCodecs: Sized + 'static {
    fn codecs() -> CodecRegistry<Self>;
}

impl DefaultCodecs for String {
    fn codecs() -> CodecRegistry<Self> {
        CodecRegistry::new()
            .register("json", "json", "json", Arc::new(JsonCodec::<String>::default()))
            .register_kafka("string", "String", Arc::new(StringCodec))
    }
}

impl DefaultCodecs for i32 {
    fn codecs() -> CodecRegistry<Self> {
        CodecRegistry::new()
            .register("json", "json", "json", Arc::new(JsonCodec::<i32>::default()))
            .register_kafka("integer", "Integer", Arc::new(IntegerCodec))
    }
}

impl DefaultCodecs for i64 {
    fn codecs() -> CodecRegistry<Self> {
        CodecRegistry::new()
            .register("json", "json", "json", Arc::new(JsonCodec::<i64>::default()))
            .register_kafka("long", "Long", Arc::new(LongCodec))
    }
}

impl DefaultCodecs for Vec<u8> {
    fn codecs() -> CodecRegistry<Self> {
        CodecRegistry::new().register_kafka("bytes", "ByteArray", Arc::new(BytesCodec))
    }
}

impl DefaultCodecs for serde_json::Value {
    fn codecs() -> CodecRegistry<Self> {
        CodecRegistry::new().register(
            "json",
            "json",
            "json",
            Arc::new(JsonCodec::<serde_json::Value>::default()),
        )
    }
}
