//! In-memory blob store

use super::{BlobKind, BlobStore, StorageError, StorageKey};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

/// Blob store backed by a concurrent map; contents are lost on drop
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    entries: DashMap<StorageKey, Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs held across all sessions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &StorageKey, value: Bytes) -> Result<(), StorageError> {
        self.entries.insert(key.clone(), value);
        Ok(())
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, StorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, session_id: &str, kind: BlobKind) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().session_id == session_id && entry.key().kind == kind)
            .map(|entry| entry.key().id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
