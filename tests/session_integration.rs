//! Integration tests for a full context-engine session
//!
//! These tests drive the orchestrator through its public API with a
//! canned model provider and in-memory storage.

mod common;

use common::{config, start, start_on, words, FaultyBlobStore, FixedProvider};
use context_engine::context::{
    CompressionLevel, ContextOrchestrator, EmergencyAction, Message, SessionDeps, SnapshotReason,
};
use context_engine::storage::{BlobKind, BlobStore};
use context_engine::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_budget_holds_over_long_conversation() {
    let session = start(FixedProvider::replying(40)).await;
    let sizes = [120, 480, 900, 300, 650, 75, 820, 410];

    let mut compressions = 0;
    for i in 0..48 {
        let size = sizes[i % sizes.len()];
        let message = if i % 2 == 0 {
            Message::user(words(size))
        } else {
            Message::assistant(words(size))
        };
        let result = session.orchestrator.add_message(message).await;
        assert!(result.success, "message {} failed: {:?}", i, result.error);
        if result.compression_triggered {
            compressions += 1;
        }

        let usage = session.orchestrator.get_usage().await;
        assert!(usage.total <= usage.provider_limit);
    }

    assert!(compressions > 0);
    assert_eq!(session.orchestrator.get_history().await.messages.len(), 48);

    let checkpoints = session.orchestrator.get_checkpoints().await;
    assert!(checkpoints
        .windows(2)
        .all(|pair| pair[0].compression_generation <= pair[1].compression_generation));
}

#[tokio::test]
async fn test_rollover_when_summarization_fails() {
    let session = start(FixedProvider::failing()).await;

    for i in 0..6 {
        let result = session.orchestrator.add_message(Message::user(words(1000))).await;
        assert!(result.success, "message {} failed: {:?}", i, result.error);
        assert_ne!(result.action, EmergencyAction::Rollover);
    }
    // Too few messages qualify for a normal pass, so the model is untouched
    assert_eq!(session.provider.call_count(), 0);

    let result = session
        .orchestrator
        .add_message(Message::assistant(words(1000)))
        .await;

    assert!(result.success);
    assert!(result.compression_triggered);
    assert_eq!(result.action, EmergencyAction::Rollover);
    // Emergency pass does not retry
    assert_eq!(session.provider.call_count(), 1);

    let tokens = session.orchestrator.get_token_count().await;
    assert_eq!(tokens.total, 1500);
    assert_eq!(result.tokens_freed, Some(6000));

    // The discarded state is recoverable from the reported snapshot
    let rollover_id = result.snapshot_id.unwrap();
    let snapshot = session.orchestrator.get_snapshot(&rollover_id).await.unwrap().unwrap();
    assert_eq!(snapshot.reason, SnapshotReason::Rollover);
    assert_eq!(snapshot.message_count(), 7);
    assert_eq!(snapshot.active_context.token_count.total, 7500);

    let latest = session.orchestrator.get_latest_snapshot().await.unwrap().unwrap();
    assert_eq!(latest.reason, SnapshotReason::Truncation);
    assert_eq!(latest.message_count(), 1);
    assert_eq!(latest.active_context.token_count.total, 1500);
    assert_eq!(session.orchestrator.get_snapshot_count().await.unwrap(), 2);

    // Nothing is lost from the log
    assert_eq!(session.orchestrator.get_history().await.messages.len(), 7);
}

#[tokio::test]
async fn test_resume_after_rollover_stays_within_limit() {
    let session = start(FixedProvider::failing()).await;
    for _ in 0..7 {
        session.orchestrator.add_message(Message::user(words(1000))).await;
    }
    assert_eq!(session.orchestrator.get_token_count().await.total, 1500);
    let prompt = session.orchestrator.build_prompt().await;
    session.orchestrator.shutdown();

    let deps = SessionDeps::new(session.provider.clone(), Arc::clone(&session.blobs));
    let resumed = ContextOrchestrator::resume("session-1", words(500), config(), deps)
        .await
        .unwrap();

    let usage = resumed.get_usage().await;
    assert!(usage.total <= usage.provider_limit);
    assert_eq!(usage.total, 1500);
    assert_eq!(resumed.build_prompt().await, prompt);
    assert_eq!(resumed.get_history().await.messages.len(), 7);

    // Later messages replay on top of the truncated state
    let result = resumed.add_message(Message::assistant(words(200))).await;
    assert!(result.success);
    assert_eq!(resumed.get_token_count().await.total, 1700);
}

#[tokio::test]
async fn test_failed_compression_leaves_context_untouched() {
    let session = start(FixedProvider::failing()).await;
    for _ in 0..8 {
        session.orchestrator.add_message(Message::user(words(100))).await;
    }
    let before = session.orchestrator.build_prompt().await;
    let tokens_before = session.orchestrator.get_token_count().await;

    let result = session.orchestrator.compress(None).await;

    assert!(!result.success);
    assert_eq!(result.reason.as_deref(), Some("summarization failed"));
    assert_eq!(result.error.unwrap().kind, ErrorKind::TransientProvider);
    assert_eq!(session.provider.call_count(), 2);

    assert_eq!(session.orchestrator.build_prompt().await, before);
    assert_eq!(session.orchestrator.get_token_count().await, tokens_before);
    assert!(session.orchestrator.get_checkpoints().await.is_empty());
    assert_eq!(session.orchestrator.get_snapshot_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_message_added_during_compression_is_kept() {
    let session = start(FixedProvider::replying(30).with_delay(Duration::from_millis(100))).await;
    for _ in 0..8 {
        session.orchestrator.add_message(Message::user(words(100))).await;
    }

    let (compressed, added) = tokio::join!(
        session.orchestrator.compress(None),
        session.orchestrator.add_message(Message::assistant(words(3000)))
    );

    assert!(compressed.success);
    assert!(added.success);
    assert!(!added.compression_triggered);
    assert_eq!(added.reason.as_deref(), Some("compression already in progress"));
    assert_eq!(session.provider.call_count(), 1);

    // Three oldest messages were summarized; the five kept and the late one remain
    let tokens = session.orchestrator.get_token_count().await;
    assert_eq!(tokens.checkpoints, 30);
    assert_eq!(tokens.recent, 500 + 3000);
    assert_eq!(session.orchestrator.get_checkpoints().await.len(), 1);
}

#[tokio::test]
async fn test_snapshot_restore_round_trip() {
    let session = start(FixedProvider::replying(40)).await;
    for _ in 0..3 {
        session.orchestrator.add_message(Message::user(words(200))).await;
    }
    let prompt = session.orchestrator.build_prompt().await;
    let tokens = session.orchestrator.get_token_count().await;

    let created = session.orchestrator.create_snapshot().await;
    assert!(created.success);
    let snapshot_id = created.snapshot_id.unwrap();

    for _ in 0..2 {
        session.orchestrator.add_message(Message::assistant(words(300))).await;
    }
    assert_ne!(session.orchestrator.get_token_count().await, tokens);

    let restored = session.orchestrator.restore_snapshot(&snapshot_id).await;
    assert!(restored.success);
    assert_eq!(session.orchestrator.build_prompt().await, prompt);
    assert_eq!(session.orchestrator.get_token_count().await, tokens);
}

#[tokio::test]
async fn test_resume_rebuilds_active_context() {
    let session = start(FixedProvider::replying(60)).await;
    for _ in 0..7 {
        session.orchestrator.add_message(Message::user(words(500))).await;
    }
    assert_eq!(session.orchestrator.generation(), 1);
    for _ in 0..2 {
        let result = session.orchestrator.add_message(Message::assistant(words(100))).await;
        assert!(!result.compression_triggered);
    }

    let prompt = session.orchestrator.build_prompt().await;
    let tokens = session.orchestrator.get_token_count().await;
    let checkpoints = session.orchestrator.get_checkpoints().await;
    session.orchestrator.shutdown();

    let deps = SessionDeps::new(session.provider.clone(), Arc::clone(&session.blobs));
    let resumed = ContextOrchestrator::resume("session-1", words(500), config(), deps)
        .await
        .unwrap();

    assert_eq!(resumed.generation(), 1);
    assert_eq!(resumed.get_token_count().await, tokens);
    assert_eq!(resumed.get_checkpoints().await, checkpoints);
    assert_eq!(resumed.build_prompt().await, prompt);
    assert_eq!(resumed.get_history().await.messages.len(), 9);
}

#[tokio::test]
async fn test_resume_unknown_session_fails() {
    let provider = Arc::new(FixedProvider::replying(10));
    let blobs = Arc::new(context_engine::storage::MemoryBlobStore::new());
    let deps = SessionDeps::new(provider, blobs);

    let result = ContextOrchestrator::resume("nobody", "system", config(), deps).await;
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Storage));
}

#[tokio::test]
async fn test_checkpoints_age_and_merge_across_generations() {
    let session = start(FixedProvider::replying(20)).await;
    for _ in 0..7 {
        session.orchestrator.add_message(Message::user(words(100))).await;
    }

    for generation in 1..=8 {
        let result = session.orchestrator.compress(None).await;
        assert!(result.success, "pass {} failed: {:?}", generation, result.error);
        assert_eq!(session.orchestrator.generation(), generation);
        for _ in 0..2 {
            session.orchestrator.add_message(Message::assistant(words(100))).await;
        }
    }

    let checkpoints = session.orchestrator.get_checkpoints().await;
    assert_eq!(checkpoints.len(), 7);

    let merged = &checkpoints[0];
    assert!(merged.merged);
    assert_eq!(merged.compression_generation, 2);
    assert_eq!(merged.source_message_ids.len(), 4);
    assert_eq!(merged.original_tokens, 400);

    let levels: Vec<CompressionLevel> = checkpoints.iter().map(|c| c.level).collect();
    assert_eq!(
        levels,
        vec![
            CompressionLevel::Compact,
            CompressionLevel::Compact,
            CompressionLevel::Compact,
            CompressionLevel::Moderate,
            CompressionLevel::Moderate,
            CompressionLevel::Detailed,
            CompressionLevel::Detailed,
        ]
    );
    assert!(checkpoints.iter().all(|c| c.token_count <= c.level.ceiling()));

    let history = session.orchestrator.get_history().await;
    assert_eq!(history.metadata.compression_count, 8);
    // Retention keeps the newest checkpoint snapshots
    assert_eq!(session.orchestrator.get_snapshot_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_failed_message_write_is_reported() {
    let faulty = Arc::new(FaultyBlobStore::new());
    let blobs: Arc<dyn BlobStore> = faulty.clone();
    let session = start_on(FixedProvider::replying(40), blobs, config()).await;

    faulty.fail_puts(BlobKind::Message);
    let result = session.orchestrator.add_message(Message::user(words(100))).await;

    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, ErrorKind::Storage);
    assert_eq!(faulty.rejected_count(), 1);
    // The active context still sees the message
    assert_eq!(session.orchestrator.get_token_count().await.total, 600);
    assert!(session.orchestrator.get_history().await.messages.is_empty());

    faulty.heal();
    let result = session.orchestrator.add_message(Message::assistant(words(50))).await;
    assert!(result.success);
    assert_eq!(session.orchestrator.get_history().await.messages.len(), 1);
}

#[tokio::test]
async fn test_rollover_aborts_when_snapshot_fails() {
    let faulty = Arc::new(FaultyBlobStore::new());
    let blobs: Arc<dyn BlobStore> = faulty.clone();
    let session = start_on(FixedProvider::failing(), blobs, config()).await;
    faulty.fail_puts(BlobKind::Snapshot);

    for _ in 0..6 {
        session.orchestrator.add_message(Message::user(words(1000))).await;
    }
    let result = session
        .orchestrator
        .add_message(Message::assistant(words(1000)))
        .await;

    assert!(!result.success);
    assert_ne!(result.action, EmergencyAction::Rollover);
    assert!(result.snapshot_id.is_none());
    assert_eq!(result.reason.as_deref(), Some("rollover aborted: snapshot failed"));
    assert_eq!(result.error.unwrap().kind, ErrorKind::Storage);
    assert_eq!(faulty.rejected_count(), 1);

    // Nothing was discarded without a snapshot
    let tokens = session.orchestrator.get_token_count().await;
    assert_eq!(tokens.total, 7500);
    assert_eq!(session.orchestrator.build_prompt().await.len(), 8);
    assert_eq!(session.orchestrator.get_snapshot_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_emergency_pass_fails_fast() {
    let session = start(FixedProvider::failing()).await;
    for _ in 0..8 {
        session.orchestrator.add_message(Message::user(words(100))).await;
    }
    let tokens = session.orchestrator.get_token_count().await;

    let result = session.orchestrator.handle_emergency().await;

    assert_eq!(result.action, EmergencyAction::None);
    assert_eq!(result.reason.as_deref(), Some("summarization failed"));
    assert_eq!(result.tokens_freed, Some(0));
    assert!(result.snapshot_id.is_none());
    // No stricter retry on the emergency rung
    assert_eq!(session.provider.call_count(), 1);
    assert_eq!(session.orchestrator.get_token_count().await, tokens);
}

#[tokio::test]
async fn test_emergency_pass_keeps_two_recent() {
    let session = start(FixedProvider::replying(30)).await;
    for _ in 0..8 {
        session.orchestrator.add_message(Message::user(words(100))).await;
    }

    let result = session.orchestrator.handle_emergency().await;

    assert!(result.success);
    assert_eq!(result.action, EmergencyAction::EmergencyCompressed);
    assert_eq!(result.tokens_freed, Some(570));
    assert_eq!(session.provider.call_count(), 1);

    let tokens = session.orchestrator.get_token_count().await;
    assert_eq!(tokens.recent, 200);
    assert_eq!(tokens.checkpoints, 30);
    let checkpoints = session.orchestrator.get_checkpoints().await;
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].source_message_ids.len(), 6);
}

#[tokio::test]
async fn test_emergency_rolls_over_after_model_switch() {
    let session = start(FixedProvider::failing()).await;
    for _ in 0..6 {
        let result = session.orchestrator.add_message(Message::user(words(550))).await;
        assert!(!result.compression_triggered);
    }
    assert_eq!(session.orchestrator.get_token_count().await.total, 3800);

    // A smaller window leaves the context over its provider limit
    assert!(session.orchestrator.switch_model(4096).await.success);
    let usage = session.orchestrator.get_usage().await;
    assert_eq!(usage.provider_limit, 3481);
    assert!(usage.total > usage.provider_limit);

    let result = session.orchestrator.handle_emergency().await;

    assert!(result.success);
    assert_eq!(result.action, EmergencyAction::Rollover);
    assert_eq!(result.tokens_freed, Some(2750));
    assert_eq!(session.provider.call_count(), 1);
    assert_eq!(session.orchestrator.get_token_count().await.total, 1050);

    let snapshot = session
        .orchestrator
        .get_snapshot(&result.snapshot_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.reason, SnapshotReason::Rollover);
    assert_eq!(snapshot.message_count(), 6);
}

#[tokio::test]
async fn test_emergency_rejected_while_compressing() {
    let session = start(FixedProvider::replying(30).with_delay(Duration::from_millis(100))).await;
    for _ in 0..8 {
        session.orchestrator.add_message(Message::user(words(100))).await;
    }

    let (compressed, emergency) = tokio::join!(
        session.orchestrator.compress(None),
        session.orchestrator.handle_emergency()
    );

    assert!(compressed.success);
    assert!(!emergency.success);
    assert_eq!(emergency.action, EmergencyAction::None);
    assert_eq!(emergency.reason.as_deref(), Some("compression already in progress"));
    assert_eq!(emergency.error.unwrap().kind, ErrorKind::ConcurrencyRejection);
    assert_eq!(session.provider.call_count(), 1);
}
