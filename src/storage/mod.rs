//! Durable blob storage for session state
//!
//! Everything the engine persists (messages, checkpoint records, snapshots,
//! session metadata) is written as an opaque blob keyed by
//! `(session_id, kind, id)`. Backends must make each `put` crash-consistent:
//! a reader sees either the previous value or the new one, never a partial
//! write.

pub mod codec;
pub mod file;
pub mod memory;

pub use file::FileBlobStore;
pub use memory::MemoryBlobStore;

use crate::config::{StorageBackend, StorageConfig};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Category of a stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    Message,
    CheckpointRecord,
    Snapshot,
    Metadata,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "messages",
            Self::CheckpointRecord => "checkpoints",
            Self::Snapshot => "snapshots",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub session_id: String,
    pub kind: BlobKind,
    pub id: String,
}

impl StorageKey {
    pub fn new(session_id: impl Into<String>, kind: BlobKind, id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.session_id, self.kind, self.id)
    }
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode blob: {0}")]
    Encode(String),

    #[error("Failed to decode blob {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Blob {0} failed integrity check")]
    Corrupt(String),

    #[error("Invalid storage key component: {0:?}")]
    InvalidKey(String),
}

/// Key-value blob store
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write a blob, replacing any previous value
    async fn put(&self, key: &StorageKey, value: Bytes) -> Result<(), StorageError>;

    /// Read a blob, `None` if absent
    async fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, StorageError>;

    /// Remove a blob; removing an absent blob is not an error
    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError>;

    /// Ids of all blobs of `kind` for a session, in lexicographic order
    async fn list(&self, session_id: &str, kind: BlobKind) -> Result<Vec<String>, StorageError>;
}

/// Open the backend selected in configuration
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, StorageError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryBlobStore::new())),
        StorageBackend::File => Ok(Arc::new(FileBlobStore::new(&config.path).await?)),
    }
}

/// Zero-padded sequence id so lexicographic order equals append order
pub fn sequence_id(sequence: usize) -> String {
    format!("{:012}", sequence)
}
