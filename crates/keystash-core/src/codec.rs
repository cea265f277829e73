//! Typed value <-> bytes mapping. JSON via `serde_json`; stateless.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;

/// Encode a value to JSON bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::Encoding {
        reason: e.to_string(),
    })
}

/// Decode JSON bytes into `T`. Truncated input and schema mismatches both
/// surface as `Decoding`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Decoding {
        reason: e.to_string(),
    })
}
