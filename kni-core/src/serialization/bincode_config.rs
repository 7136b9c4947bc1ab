//! Deterministic bincode configuration.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::SerializationError;

/// Fixed-size integers, little-endian, trailing bytes rejected.
fn config() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Serialize a value to bytes.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, SerializationError> {
    config()
        .serialize(value)
        .map_err(|e| SerializationError::EncodeFailed(e.to_string()))
}

/// Deserialize a value from bytes.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    config()
        .deserialize(bytes)
        .map_err(|e| SerializationError::DecodeFailed(e.to_string()))
}

/// Deserialize untrusted input, refusing to allocate more than `limit` bytes.
///
/// A hostile length prefix inside the payload (for a `Vec` or `String`)
/// fails instead of reserving a huge buffer.
pub fn deserialize_bounded<T: DeserializeOwned>(
    bytes: &[u8],
    limit: u64,
) -> Result<T, SerializationError> {
    config()
        .with_limit(limit)
        .deserialize(bytes)
        .map_err(|e| SerializationError::DecodeFailed(e.to_string()))
}
