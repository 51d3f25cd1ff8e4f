//! Blob encoding (MessagePack)

use super::{StorageError, StorageKey};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Encode a value for storage
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, StorageError> {
    rmp_serde::to_vec_named(value)
        .map(Bytes::from)
        .map_err(|e| StorageError::Encode(e.to_string()))
}

/// Decode a stored value
pub fn decode<T: DeserializeOwned>(key: &StorageKey, bytes: &[u8]) -> Result<T, StorageError> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Hex SHA-256 over the encoded form of a value
pub fn checksum<T: Serialize>(value: &T) -> Result<String, StorageError> {
    let bytes = encode(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
