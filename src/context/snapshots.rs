//! Snapshot lifecycle
//!
//! Snapshots are immutable copies of the active context stored as blobs
//! under `(session_id, snapshot_id)`. Ids embed the creation time and a
//! sequence number so listing order is creation order. Counts and the
//! latest snapshot are always read from storage.

use super::models::{ActiveContext, HistoryCursor, Snapshot, SnapshotReason};
use crate::config::SnapshotConfig;
use crate::metrics::METRICS;
use crate::storage::{codec, BlobKind, BlobStore, StorageError, StorageKey};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates, loads and prunes one session's snapshots
pub struct SnapshotManager {
    session_id: String,
    store: Arc<dyn BlobStore>,
    config: SnapshotConfig,
    sequence: AtomicU64,
}

impl SnapshotManager {
    pub fn new(session_id: impl Into<String>, store: Arc<dyn BlobStore>, config: SnapshotConfig) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    fn key(&self, id: &str) -> StorageKey {
        StorageKey::new(&self.session_id, BlobKind::Snapshot, id)
    }

    fn next_id(&self, now: DateTime<Utc>) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("snap-{:013}-{:06}", now.timestamp_millis().max(0), sequence)
    }

    /// Store a deep copy of `context`, then apply retention
    pub async fn create(
        &self,
        context: &ActiveContext,
        cursor: HistoryCursor,
        reason: SnapshotReason,
    ) -> Result<Snapshot, StorageError> {
        let now = Utc::now();
        let snapshot = Snapshot {
            id: self.next_id(now),
            session_id: self.session_id.clone(),
            created_at: now,
            active_context: context.clone(),
            history_cursor: cursor,
            ttl_secs: self.config.ttl_secs,
            reason,
            checksum: codec::checksum(context)?,
        };

        self.store
            .put(&self.key(&snapshot.id), codec::encode(&snapshot)?)
            .await?;
        METRICS.snapshots_created.inc();
        info!(
            "Created {:?} snapshot {} ({} recent messages, {} checkpoints)",
            reason,
            snapshot.id,
            snapshot.message_count(),
            snapshot.active_context.checkpoints.len()
        );

        if let Err(e) = self.prune(now).await {
            warn!("Snapshot pruning failed: {}", e);
        }
        Ok(snapshot)
    }

    /// Load a snapshot, verifying its checksum
    pub async fn get(&self, id: &str) -> Result<Option<Snapshot>, StorageError> {
        let key = self.key(id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let snapshot: Snapshot = codec::decode(&key, &bytes)?;

        let actual = codec::checksum(&snapshot.active_context)?;
        if actual != snapshot.checksum {
            return Err(StorageError::Corrupt(format!(
                "snapshot {} checksum mismatch",
                id
            )));
        }
        Ok(Some(snapshot))
    }

    /// Stored snapshot ids, oldest first
    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        self.store.list(&self.session_id, BlobKind::Snapshot).await
    }

    pub async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.list().await?.len())
    }

    pub async fn latest(&self) -> Result<Option<Snapshot>, StorageError> {
        match self.list().await?.last() {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    /// Newest snapshot a session can be resumed from
    pub async fn latest_resume_base(&self) -> Result<Option<Snapshot>, StorageError> {
        for id in self.list().await?.iter().rev() {
            match self.get(id).await? {
                Some(snapshot) if snapshot.reason.is_resume_base() => return Ok(Some(snapshot)),
                Some(snapshot) => debug!("Skipping {:?} snapshot {}", snapshot.reason, id),
                None => {}
            }
        }
        Ok(None)
    }

    /// Drop expired snapshots, then the oldest beyond the retention count
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut remaining = Vec::new();
        let mut pruned = 0;

        for id in self.list().await? {
            let key = self.key(&id);
            let expired = match self.store.get(&key).await? {
                Some(bytes) => match codec::decode::<Snapshot>(&key, &bytes) {
                    Ok(snapshot) => snapshot.is_expired(now),
                    Err(e) => {
                        warn!("Removing unreadable snapshot {}: {}", id, e);
                        true
                    }
                },
                None => continue,
            };

            if expired {
                self.store.delete(&key).await?;
                pruned += 1;
            } else {
                remaining.push(id);
            }
        }

        let excess = remaining.len().saturating_sub(self.config.max_count);
        for id in remaining.iter().take(excess) {
            self.store.delete(&self.key(id)).await?;
            pruned += 1;
        }

        if pruned > 0 {
            METRICS.snapshots_pruned.inc_by(pruned as u64);
            debug!("Pruned {} snapshots for session {}", pruned, self.session_id);
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::Message;
    use crate::storage::MemoryBlobStore;

    fn context(messages: usize) -> ActiveContext {
        let mut context = ActiveContext::new(Message::system("system"));
        for i in 0..messages {
            let mut message = Message::user(format!("message {}", i));
            message.token_count = 2;
            context.recent_messages.push(message);
        }
        context.recompute_tokens();
        context
    }

    fn manager(max_count: usize) -> (SnapshotManager, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryBlobStore::new());
        let config = SnapshotConfig {
            max_count,
            ..SnapshotConfig::default()
        };
        (SnapshotManager::new("s1", store.clone(), config), store)
    }

    #[tokio::test]
    async fn test_snapshot_is_independent_copy() {
        let (manager, _) = manager(5);
        let mut live = context(3);
        let snapshot = manager
            .create(&live, HistoryCursor::default(), SnapshotReason::Manual)
            .await
            .unwrap();

        live.recent_messages.clear();
        live.recompute_tokens();

        let loaded = manager.get(&snapshot.id).await.unwrap().unwrap();
        assert_eq!(loaded.active_context, snapshot.active_context);
        assert_eq!(loaded.message_count(), 3);
        assert_ne!(loaded.active_context, live);
    }

    #[tokio::test]
    async fn test_count_and_latest_follow_storage() {
        let (manager, store) = manager(10);
        assert_eq!(manager.count().await.unwrap(), 0);
        assert!(manager.latest().await.unwrap().is_none());

        let first = manager
            .create(&context(1), HistoryCursor::default(), SnapshotReason::Checkpoint)
            .await
            .unwrap();
        let second = manager
            .create(&context(2), HistoryCursor::default(), SnapshotReason::Checkpoint)
            .await
            .unwrap();
        assert!(first.id < second.id);
        assert_eq!(manager.count().await.unwrap(), 2);
        assert_eq!(manager.latest().await.unwrap().unwrap().id, second.id);

        // Deleted behind the manager's back
        store.delete(&manager.key(&second.id)).await.unwrap();
        assert_eq!(manager.count().await.unwrap(), 1);
        assert_eq!(manager.latest().await.unwrap().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_resume_base_skips_rollover() {
        let (manager, _) = manager(10);
        assert!(manager.latest_resume_base().await.unwrap().is_none());

        let checkpoint = manager
            .create(&context(2), HistoryCursor::default(), SnapshotReason::Checkpoint)
            .await
            .unwrap();
        manager
            .create(&context(6), HistoryCursor::default(), SnapshotReason::Rollover)
            .await
            .unwrap();
        assert_eq!(manager.latest().await.unwrap().unwrap().reason, SnapshotReason::Rollover);
        assert_eq!(manager.latest_resume_base().await.unwrap().unwrap().id, checkpoint.id);

        let truncated = manager
            .create(&context(1), HistoryCursor::default(), SnapshotReason::Truncation)
            .await
            .unwrap();
        let base = manager.latest_resume_base().await.unwrap().unwrap();
        assert_eq!(base.id, truncated.id);
        assert_eq!(base.message_count(), 1);
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest() {
        let (manager, _) = manager(2);
        let mut ids = Vec::new();
        for i in 0..4 {
            let snapshot = manager
                .create(&context(i), HistoryCursor::default(), SnapshotReason::Checkpoint)
                .await
                .unwrap();
            ids.push(snapshot.id);
        }

        assert_eq!(manager.list().await.unwrap(), ids[2..].to_vec());
    }

    #[tokio::test]
    async fn test_prune_expired() {
        let (manager, _) = manager(5);
        let snapshot = manager
            .create(&context(1), HistoryCursor::default(), SnapshotReason::Manual)
            .await
            .unwrap();

        let later = snapshot.created_at + chrono::Duration::seconds(snapshot.ttl_secs as i64 + 1);
        assert_eq!(manager.prune(later).await.unwrap(), 1);
        assert_eq!(manager.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_detected() {
        let (manager, store) = manager(5);
        let snapshot = manager
            .create(&context(2), HistoryCursor::default(), SnapshotReason::Manual)
            .await
            .unwrap();

        let mut tampered = snapshot.clone();
        tampered.active_context.recent_messages.pop();
        let key = manager.key(&snapshot.id);
        store
            .put(&key, codec::encode(&tampered).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            manager.get(&snapshot.id).await,
            Err(StorageError::Corrupt(_))
        ));
    }
}
