use serde::{Deserialize, Serialize};

/// Record-level serialization failure.
///
/// Carries enough context to tell a malformed payload apart from a schema
/// mismatch. Delivered inline on the record stream; it never tears down the
/// consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializationError {
    SerializationFailed(String),
    DeserializationFailed(String),
    InvalidUtf8(String),
    SchemaError(String),
}

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializationError::SerializationFailed(msg) => {
                write!(f, "Serialization failed: {}", msg)
            }
            SerializationError::DeserializationFailed(msg) => {
                write!(f, "Deserialization failed: {}", msg)
            }
            SerializationError::InvalidUtf8(msg) => {
                write!(f, "Invalid UTF-8: {}", msg)
            }
            SerializationError::SchemaError(msg) => {
                write!(f, "Schema error: {}", msg)
            }
        }
    }
}

impl std::error::Error for SerializationError {}

/// Trait for serializers that convert between typed values and Kafka byte
/// payloads.
///
/// Key and value serdes are independent; a consumer is parameterized by one
/// of each.
pub trait Serde<T>: Send + Sync {
    /// Serialize a value to bytes
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    /// Deserialize bytes to a value
    fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializationError>;
}

// JSON Serialization Helpers
//==========================

/// Serialize a value to JSON bytes
pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, SerializationError> {
    serde_json::to_vec(value)
        .map_err(|e| SerializationError::SerializationFailed(format!("JSON encode: {}", e)))
}

/// Deserialize JSON bytes to a value
pub fn from_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, SerializationError> {
    serde_json::from_slice(bytes)
        .map_err(|e| SerializationError::DeserializationFailed(format!("JSON decode: {}", e)))
}

/// JSON serializer backed by serde_json
#[derive(Clone, Copy, Default)]
pub struct JsonSerializer;

impl<T> Serde<T> for JsonSerializer
where
    T: Serialize + for<'de> Deserialize<'de> + Send + Sync,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        to_json(value)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        from_json(bytes)
    }
}

/// String serializer that converts strings to/from UTF-8 bytes
#[derive(Clone, Copy, Default)]
pub struct StringSerializer;

impl Serde<String> for StringSerializer {
    fn serialize(&self, value: &String) -> Result<Vec<u8>, SerializationError> {
        Ok(value.as_bytes().to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, SerializationError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SerializationError::InvalidUtf8(e.to_string()))
    }
}

/// Raw bytes serializer that performs no conversion
#[derive(Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serde<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>) -> Result<Vec<u8>, SerializationError> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>, SerializationError> {
        Ok(bytes.to_vec())
    }
}
