//! Filesystem blob store
//!
//! Layout: `<root>/<session_id>/<kind>/<id>.bin`. Writes go to a temporary
//! sibling file first and are renamed into place, so a crash mid-write
//! leaves the previous blob intact.

use super::{BlobKind, BlobStore, StorageError, StorageKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const BLOB_EXTENSION: &str = "bin";

/// Blob store rooted at a directory
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Create the store, making sure the root directory exists
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, session_id: &str, kind: BlobKind) -> Result<PathBuf, StorageError> {
        check_component(session_id)?;
        Ok(self.root.join(session_id).join(kind.as_str()))
    }

    fn blob_path(&self, key: &StorageKey) -> Result<PathBuf, StorageError> {
        check_component(&key.id)?;
        Ok(self
            .kind_dir(&key.session_id, key.kind)?
            .join(format!("{}.{}", key.id, BLOB_EXTENSION)))
    }
}

/// Key components become path segments and must not escape the root
fn check_component(component: &str) -> Result<(), StorageError> {
    let valid = !component.is_empty()
        && component != "."
        && component != ".."
        && !component.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(component.to_string()))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, key: &StorageKey, value: Bytes) -> Result<(), StorageError> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let write_result = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&value).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &path).await
        }
        .await;

        if let Err(e) = write_result {
            // Best effort; the temp file is never read
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!("Stored blob {} ({} bytes)", key, value.len());
        Ok(())
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, StorageError> {
        let path = self.blob_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        let path = self.blob_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, session_id: &str, kind: BlobKind) -> Result<Vec<String>, StorageError> {
        let dir = self.kind_dir(session_id, kind)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
