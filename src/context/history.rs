//! Session history log
//!
//! Append-only durable record of every message and checkpoint a session has
//! produced. Each event is written to the blob store before it is mirrored
//! in memory, so the in-memory view never claims more than was persisted.

use super::models::{CheckpointRecord, HistoryCursor, Message, SessionHistory};
use crate::storage::{codec, sequence_id, BlobKind, BlobStore, StorageError, StorageKey};
use std::sync::Arc;
use tracing::{debug, info};

const METADATA_ID: &str = "session";

/// Durable, append-only session log
pub struct SessionHistoryLog {
    history: SessionHistory,
    store: Arc<dyn BlobStore>,
}

impl SessionHistoryLog {
    /// Start a fresh log, persisting empty metadata
    ///
    /// This is the first write of a session; a failure here means storage is
    /// unavailable and the session should not start.
    pub async fn create(
        session_id: impl Into<String>,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self, StorageError> {
        let log = Self {
            history: SessionHistory::new(session_id),
            store,
        };
        log.persist_metadata().await?;
        Ok(log)
    }

    /// Reload a log previously written to `store`
    ///
    /// Fails with [`StorageError::NotFound`] if the session was never created.
    pub async fn open(
        session_id: impl Into<String>,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self, StorageError> {
        let mut history = SessionHistory::new(session_id);
        let session_id = history.session_id.clone();

        let key = StorageKey::new(&session_id, BlobKind::Metadata, METADATA_ID);
        let metadata = store
            .get(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        history.metadata = codec::decode(&key, &metadata)?;

        for id in store.list(&session_id, BlobKind::Message).await? {
            let key = StorageKey::new(&session_id, BlobKind::Message, id);
            if let Some(bytes) = store.get(&key).await? {
                history.messages.push(codec::decode(&key, &bytes)?);
            }
        }

        for id in store.list(&session_id, BlobKind::CheckpointRecord).await? {
            let key = StorageKey::new(&session_id, BlobKind::CheckpointRecord, id);
            if let Some(bytes) = store.get(&key).await? {
                history.checkpoint_records.push(codec::decode(&key, &bytes)?);
            }
        }

        info!(
            "Opened session {} history: {} messages, {} checkpoint records",
            session_id,
            history.messages.len(),
            history.checkpoint_records.len()
        );

        Ok(Self { history, store })
    }

    pub fn session_id(&self) -> &str {
        &self.history.session_id
    }

    /// Durably append a message
    pub async fn append_message(&mut self, message: &Message) -> Result<(), StorageError> {
        let key = StorageKey::new(
            &self.history.session_id,
            BlobKind::Message,
            sequence_id(self.history.messages.len()),
        );
        self.store.put(&key, codec::encode(message)?).await?;

        self.history.messages.push(message.clone());
        self.history.metadata.token_count += message.token_count;
        self.persist_metadata().await?;

        debug!("Appended message {} as {}", message.id, key);
        Ok(())
    }

    /// Durably append a checkpoint record
    pub async fn record_checkpoint(&mut self, record: CheckpointRecord) -> Result<(), StorageError> {
        let key = StorageKey::new(
            &self.history.session_id,
            BlobKind::CheckpointRecord,
            sequence_id(self.history.checkpoint_records.len()),
        );
        self.store.put(&key, codec::encode(&record)?).await?;

        debug!(
            "Recorded {:?} checkpoint {} ({} -> {} tokens)",
            record.kind, record.checkpoint_id, record.original_tokens, record.compressed_tokens
        );
        self.history.checkpoint_records.push(record);
        self.persist_metadata().await
    }

    /// Count a compression pass whose checkpoint was committed
    ///
    /// Records are written before a pass commits, so a rolled-back pass
    /// leaves a record but no count.
    pub async fn mark_compression_committed(&mut self) -> Result<(), StorageError> {
        self.history.metadata.compression_count += 1;
        self.persist_metadata().await
    }

    /// Read view of everything recorded so far
    pub fn get_history(&self) -> &SessionHistory {
        &self.history
    }

    pub fn cursor(&self) -> HistoryCursor {
        self.history.cursor()
    }

    async fn persist_metadata(&self) -> Result<(), StorageError> {
        let key = StorageKey::new(&self.history.session_id, BlobKind::Metadata, METADATA_ID);
        self.store
            .put(&key, codec::encode(&self.history.metadata)?)
            .await
    }
}
