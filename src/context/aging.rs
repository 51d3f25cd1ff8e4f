//! Checkpoint lifecycle: aging and merging
//!
//! Checkpoints drift towards more compact levels as the session's
//! compression generation advances:
//!
//! - `age >= moderate_age`: detailed checkpoints are re-summarized at the
//!   moderate level
//! - `age >= compact_age`: re-summarized at the compact level
//! - `age >= merge_age`: all eligible checkpoints are merged into one
//!
//! Aging always goes through the summarizer and never grows a checkpoint.
//! A failure skips that checkpoint for this cycle only.

use super::active::ActiveContextStore;
use super::history::SessionHistoryLog;
use super::models::{CheckpointRecord, CheckpointSummary, CompressionLevel, RecordKind};
use super::summarizer::{Summarizer, SummaryRequest};
use crate::config::AgingConfig;
use crate::metrics::METRICS;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One checkpoint moved to a more compact level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgedCheckpoint {
    pub checkpoint_id: String,
    pub from: CompressionLevel,
    pub to: CompressionLevel,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Several checkpoints merged into one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedCheckpoints {
    pub merged_id: String,
    pub source_ids: Vec<String>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// What one aging cycle did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgingReport {
    pub aged: Vec<AgedCheckpoint>,
    pub merged: Option<MergedCheckpoints>,
    /// Checkpoint ids left alone this cycle, with the reason
    pub skipped: Vec<(String, String)>,
}

impl AgingReport {
    pub fn tokens_saved(&self) -> usize {
        let aged: usize = self
            .aged
            .iter()
            .map(|a| a.tokens_before - a.tokens_after)
            .sum();
        let merged = self
            .merged
            .as_ref()
            .map(|m| m.tokens_before - m.tokens_after)
            .unwrap_or(0);
        aged + merged
    }

    pub fn is_empty(&self) -> bool {
        self.aged.is_empty() && self.merged.is_none()
    }
}

/// Ages and merges checkpoints in the active context
pub struct CheckpointLifecycle {
    store: Arc<RwLock<ActiveContextStore>>,
    history: Arc<Mutex<SessionHistoryLog>>,
    summarizer: Arc<dyn Summarizer>,
    config: AgingConfig,
}

impl CheckpointLifecycle {
    pub fn new(
        store: Arc<RwLock<ActiveContextStore>>,
        history: Arc<Mutex<SessionHistoryLog>>,
        summarizer: Arc<dyn Summarizer>,
        config: AgingConfig,
    ) -> Self {
        Self {
            store,
            history,
            summarizer,
            config,
        }
    }

    /// Level a checkpoint of this age should be at, if lower than its current one
    pub fn target_level(&self, checkpoint: &CheckpointSummary, generation: u32) -> Option<CompressionLevel> {
        let age = checkpoint.age(generation);
        let target = if age >= self.config.compact_age {
            CompressionLevel::Compact
        } else if age >= self.config.moderate_age {
            CompressionLevel::Moderate
        } else {
            return None;
        };
        (target < checkpoint.level).then_some(target)
    }

    /// Run one aging cycle against the current generation
    pub async fn run(&self, generation: u32, cancel: CancellationToken) -> AgingReport {
        let mut report = AgingReport::default();
        if !self.config.enabled {
            return report;
        }

        let checkpoints = self.store.read().await.checkpoints().to_vec();
        for checkpoint in &checkpoints {
            let Some(target) = self.target_level(checkpoint, generation) else {
                continue;
            };
            if cancel.is_cancelled() {
                break;
            }
            match self.age_one(checkpoint, target, cancel.clone()).await {
                Ok(aged) => report.aged.push(aged),
                Err(reason) => {
                    warn!("Skipping aging of checkpoint {}: {}", checkpoint.id, reason);
                    report.skipped.push((checkpoint.id.clone(), reason));
                }
            }
        }

        if !cancel.is_cancelled() {
            match self.merge(generation, cancel).await {
                Ok(merged) => report.merged = merged,
                Err(reason) => {
                    warn!("Skipping checkpoint merge: {}", reason);
                    report.skipped.push(("merge".to_string(), reason));
                }
            }
        }

        if !report.is_empty() {
            info!(
                "Aging cycle at generation {}: {} aged, merged: {}, {} tokens saved",
                generation,
                report.aged.len(),
                report.merged.is_some(),
                report.tokens_saved()
            );
        }
        report
    }

    async fn age_one(
        &self,
        checkpoint: &CheckpointSummary,
        target: CompressionLevel,
        cancel: CancellationToken,
    ) -> Result<AgedCheckpoint, String> {
        debug!(
            "Aging checkpoint {} from {} to {}",
            checkpoint.id, checkpoint.level, target
        );
        let request = SummaryRequest::from_texts(vec![checkpoint.summary_text.clone()], target);
        let summary = self
            .summarizer
            .summarize(request, cancel)
            .await
            .map_err(|e| e.to_string())?;

        if summary.token_count > checkpoint.token_count {
            return Err(format!(
                "aged summary would grow from {} to {} tokens",
                checkpoint.token_count, summary.token_count
            ));
        }

        let aged = CheckpointSummary {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            summary_text: summary.text,
            token_count: summary.token_count,
            level: target,
            ..checkpoint.clone()
        };

        {
            let mut store = self.store.write().await;
            let unchanged = store
                .checkpoints()
                .iter()
                .any(|c| c.id == checkpoint.id && c.token_count == checkpoint.token_count);
            if !unchanged || !store.replace_checkpoint(&checkpoint.id, aged.clone()) {
                return Err("checkpoint changed while aging".to_string());
            }
        }

        self.record(&aged, RecordKind::Aged).await;
        METRICS.aging_actions.with_label_values(&["aged"]).inc();

        Ok(AgedCheckpoint {
            checkpoint_id: aged.id,
            from: checkpoint.level,
            to: target,
            tokens_before: checkpoint.token_count,
            tokens_after: aged.token_count,
        })
    }

    async fn merge(
        &self,
        generation: u32,
        cancel: CancellationToken,
    ) -> Result<Option<MergedCheckpoints>, String> {
        let eligible: Vec<CheckpointSummary> = self
            .store
            .read()
            .await
            .checkpoints()
            .iter()
            .filter(|c| c.age(generation) >= self.config.merge_age)
            .cloned()
            .collect();
        if eligible.len() < 2 {
            return Ok(None);
        }

        let source_ids: Vec<String> = eligible.iter().map(|c| c.id.clone()).collect();
        let tokens_before: usize = eligible.iter().map(|c| c.token_count).sum();
        debug!(
            "Merging {} checkpoints ({} tokens)",
            eligible.len(),
            tokens_before
        );

        let texts = eligible.iter().map(|c| c.summary_text.clone()).collect();
        let summary = self
            .summarizer
            .summarize(
                SummaryRequest::from_texts(texts, CompressionLevel::Compact),
                cancel,
            )
            .await
            .map_err(|e| e.to_string())?;

        if summary.token_count > tokens_before {
            return Err(format!(
                "merged summary would grow from {} to {} tokens",
                tokens_before, summary.token_count
            ));
        }

        let merged = CheckpointSummary {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            summary_text: summary.text,
            source_message_ids: eligible
                .iter()
                .flat_map(|c| c.source_message_ids.iter().cloned())
                .collect(),
            token_count: summary.token_count,
            original_tokens: eligible.iter().map(|c| c.original_tokens).sum(),
            level: CompressionLevel::Compact,
            compression_generation: eligible
                .iter()
                .map(|c| c.compression_generation)
                .max()
                .unwrap_or(generation),
            merged: true,
        };

        if !self
            .store
            .write()
            .await
            .replace_checkpoints(&source_ids, merged.clone())
        {
            return Err("checkpoints changed while merging".to_string());
        }

        self.record(&merged, RecordKind::Merged).await;
        METRICS.aging_actions.with_label_values(&["merged"]).inc();

        Ok(Some(MergedCheckpoints {
            merged_id: merged.id,
            source_ids,
            tokens_before,
            tokens_after: merged.token_count,
        }))
    }

    /// History records for aging are best effort; the active context is
    /// already updated and stays valid either way
    async fn record(&self, checkpoint: &CheckpointSummary, kind: RecordKind) {
        let record = CheckpointRecord::for_checkpoint(checkpoint, kind);
        if let Err(e) = self.history.lock().await.record_checkpoint(record).await {
            warn!("Failed to record {:?} checkpoint {}: {}", kind, checkpoint.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SummarizerConfig;
    use crate::context::summarizer::SummarizationService;
    use crate::context::tier::TierPolicy;
    use crate::provider::testing::{words, Reply, ScriptedProvider};
    use crate::provider::WordBasedEstimator;
    use crate::storage::{BlobStore, MemoryBlobStore};

    fn checkpoint(id: &str, generation: u32, level: CompressionLevel, tokens: usize) -> CheckpointSummary {
        CheckpointSummary {
            id: id.to_string(),
            created_at: Utc::now(),
            summary_text: words(tokens),
            source_message_ids: vec![format!("{}-m1", id), format!("{}-m2", id)],
            token_count: tokens,
            original_tokens: tokens * 10,
            level,
            compression_generation: generation,
            merged: false,
        }
    }

    async fn lifecycle(
        checkpoints: Vec<CheckpointSummary>,
        replies: Vec<Reply>,
    ) -> (CheckpointLifecycle, Arc<RwLock<ActiveContextStore>>, Arc<Mutex<SessionHistoryLog>>) {
        let mut active = ActiveContextStore::new(
            "system",
            TierPolicy::default().resolve(8192),
            Arc::new(WordBasedEstimator::new(1.0)),
        )
        .unwrap();
        for cp in checkpoints {
            active.add_checkpoint(cp);
        }
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let history = Arc::new(Mutex::new(
            SessionHistoryLog::create("s1", blobs).await.unwrap(),
        ));
        let store = Arc::new(RwLock::new(active));
        let summarizer = Arc::new(SummarizationService::new(
            Arc::new(ScriptedProvider::new(replies)),
            SummarizerConfig::default(),
        ));
        let lifecycle = CheckpointLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&history),
            summarizer,
            AgingConfig::default(),
        );
        (lifecycle, store, history)
    }

    #[tokio::test]
    async fn test_target_levels_by_age() {
        let (lifecycle, _, _) = lifecycle(Vec::new(), vec![Reply::Fail]).await;
        let cp = checkpoint("a", 1, CompressionLevel::Detailed, 400);

        assert_eq!(lifecycle.target_level(&cp, 2), None);
        assert_eq!(lifecycle.target_level(&cp, 3), Some(CompressionLevel::Moderate));
        assert_eq!(lifecycle.target_level(&cp, 5), Some(CompressionLevel::Compact));

        let compact = checkpoint("b", 1, CompressionLevel::Compact, 80);
        assert_eq!(lifecycle.target_level(&compact, 10), None);
    }

    #[tokio::test]
    async fn test_aging_path_never_grows() {
        let (lifecycle, store, history) = lifecycle(
            vec![checkpoint("a", 1, CompressionLevel::Detailed, 400)],
            vec![Reply::Text(words(200)), Reply::Text(words(80))],
        )
        .await;

        // Generation 3: detailed -> moderate
        let report = lifecycle.run(3, CancellationToken::new()).await;
        assert_eq!(report.aged.len(), 1);
        assert_eq!(report.aged[0].to, CompressionLevel::Moderate);
        let after_moderate = store.read().await.checkpoints()[0].clone();
        assert_eq!(after_moderate.token_count, 200);
        assert_eq!(after_moderate.compression_generation, 1);

        // Generation 5: moderate -> compact
        let report = lifecycle.run(5, CancellationToken::new()).await;
        assert_eq!(report.aged[0].to, CompressionLevel::Compact);
        let after_compact = store.read().await.checkpoints()[0].clone();
        assert_eq!(after_compact.token_count, 80);
        assert!(after_compact.token_count <= after_moderate.token_count);

        let history_guard = history.lock().await;
        let records = &history_guard.get_history().checkpoint_records;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.kind == RecordKind::Aged));
    }

    #[tokio::test]
    async fn test_growing_summary_is_skipped() {
        let (lifecycle, store, _) = lifecycle(
            vec![checkpoint("a", 1, CompressionLevel::Moderate, 60)],
            vec![Reply::Text(words(90))],
        )
        .await;

        let report = lifecycle.run(5, CancellationToken::new()).await;
        assert!(report.aged.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(store.read().await.checkpoints()[0].token_count, 60);
    }

    #[tokio::test]
    async fn test_merge_old_checkpoints() {
        let (lifecycle, store, history) = lifecycle(
            vec![
                checkpoint("a", 1, CompressionLevel::Compact, 90),
                checkpoint("b", 2, CompressionLevel::Compact, 90),
                checkpoint("c", 8, CompressionLevel::Detailed, 300),
            ],
            vec![Reply::Text(words(70))],
        )
        .await;

        let report = lifecycle.run(8, CancellationToken::new()).await;
        let merged = report.merged.unwrap();
        assert_eq!(merged.source_ids, vec!["a", "b"]);
        assert_eq!(merged.tokens_before, 180);
        assert_eq!(merged.tokens_after, 70);

        let store = store.read().await;
        let checkpoints = store.checkpoints();
        assert_eq!(checkpoints.len(), 2);
        assert!(checkpoints[0].merged);
        assert_eq!(checkpoints[0].compression_generation, 2);
        assert_eq!(checkpoints[0].source_message_ids.len(), 4);
        assert_eq!(checkpoints[1].id, "c");

        let history_guard = history.lock().await;
        let records = &history_guard.get_history().checkpoint_records;
        assert_eq!(records.last().unwrap().kind, RecordKind::Merged);
    }

    #[tokio::test]
    async fn test_failures_are_not_fatal() {
        let (lifecycle, store, _) = lifecycle(
            vec![checkpoint("a", 1, CompressionLevel::Detailed, 400)],
            vec![Reply::Fail],
        )
        .await;
        let before = store.read().await.context().clone();

        let report = lifecycle.run(5, CancellationToken::new()).await;
        assert!(report.is_empty());
        assert_eq!(report.skipped[0].0, "a");
        assert_eq!(store.read().await.context(), &before);
    }
}
