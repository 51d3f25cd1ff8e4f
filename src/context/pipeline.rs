//! Compression pipeline
//!
//! One pass runs six stages in order: identify, prepare, summarize, create
//! checkpoint, update active context, validate. The store is only read until
//! stage 5; stages 5 and 6 run against a staged copy under the write lock
//! and the copy is committed only if validation passes, so any failure leaves
//! the active context exactly as it was before the pass.

use super::active::ActiveContextStore;
use super::history::SessionHistoryLog;
use super::models::{
    ratio, CheckpointRecord, CheckpointSummary, CompressionLevel, Goal, Message, RecordKind, Role,
};
use super::summarizer::{Summarizer, SummarizerError, SummaryRequest};
use crate::config::CompressionConfig;
use crate::error::ErrorKind;
use crate::metrics::METRICS;
use crate::storage::StorageError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Identify,
    Prepare,
    Summarize,
    CreateCheckpoint,
    UpdateContext,
    Validate,
    Complete,
}

impl PipelineStage {
    /// Progress reported when the stage starts
    pub fn percent(&self) -> u8 {
        match self {
            Self::Identify => 0,
            Self::Prepare => 10,
            Self::Summarize => 20,
            Self::CreateCheckpoint => 70,
            Self::UpdateContext => 80,
            Self::Validate => 90,
            Self::Complete => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identify => "identify",
            Self::Prepare => "prepare",
            Self::Summarize => "summarize",
            Self::CreateCheckpoint => "create_checkpoint",
            Self::UpdateContext => "update_context",
            Self::Validate => "validate",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress update for UI layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: PipelineStage,
    pub percent: u8,
}

/// Receives pipeline progress; never affects the outcome of a pass
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) {
        // A dropped receiver just means nobody is watching
        let _ = self.send(event);
    }
}

/// Discards progress
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Per-pass parameters
#[derive(Debug, Clone)]
pub struct PassOptions {
    /// Most recent messages left untouched
    pub keep_recent: usize,
    /// Skip the summarizer's retry
    pub fail_fast: bool,
    pub goal: Option<Goal>,
    /// Generation stamped on the new checkpoint
    pub generation: u32,
}

/// Result of a committed pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub checkpoint_id: String,
    pub source_count: usize,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub compression_ratio: f64,
    pub level: CompressionLevel,
    /// Drop in total context tokens
    pub freed_tokens: usize,
    pub total_tokens: usize,
}

/// What a pass did
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Compressed(PassReport),
    /// Too few messages qualified; nothing changed
    Skipped { qualifying: usize },
}

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Summarization(#[from] SummarizerError),

    #[error("Compression did not compress: ratio {ratio:.3}")]
    NotCompressing { ratio: f64 },

    #[error("Context still exceeds provider limit after compression: {total} > {limit}")]
    ExceedsProviderLimit { total: usize, limit: usize },

    #[error("Selected messages changed during the pass")]
    StaleSelection,

    #[error("Failed to record checkpoint: {0}")]
    Storage(#[from] StorageError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Summarization(_) => ErrorKind::TransientProvider,
            Self::NotCompressing { .. } | Self::ExceedsProviderLimit { .. } => {
                ErrorKind::Validation
            }
            Self::StaleSelection => ErrorKind::ConcurrencyRejection,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Short reason string for results
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Summarization(SummarizerError::Cancelled) => "cancelled",
            Self::Summarization(_) => "summarization failed",
            Self::NotCompressing { .. } => "compression ratio not below 1",
            Self::ExceedsProviderLimit { .. } => "exceeds provider limit",
            Self::StaleSelection => "stale selection",
            Self::Storage(_) => "storage failure",
        }
    }
}

/// Six-stage compression pass over one session's state
pub struct CompressionPipeline {
    store: Arc<RwLock<ActiveContextStore>>,
    history: Arc<Mutex<SessionHistoryLog>>,
    summarizer: Arc<dyn Summarizer>,
    config: CompressionConfig,
}

impl CompressionPipeline {
    pub fn new(
        store: Arc<RwLock<ActiveContextStore>>,
        history: Arc<Mutex<SessionHistoryLog>>,
        summarizer: Arc<dyn Summarizer>,
        config: CompressionConfig,
    ) -> Self {
        Self {
            store,
            history,
            summarizer,
            config,
        }
    }

    /// Level for a batch of `original_tokens`; larger batches compress harder
    pub fn select_level(&self, original_tokens: usize) -> CompressionLevel {
        if original_tokens >= self.config.compact_from_tokens {
            CompressionLevel::Compact
        } else if original_tokens >= self.config.moderate_from_tokens {
            CompressionLevel::Moderate
        } else {
            CompressionLevel::Detailed
        }
    }

    /// Messages eligible for compression: everything but the newest
    /// `keep_recent`, excluding system messages
    pub fn identify(&self, recent: &[Message], keep_recent: usize) -> Vec<Message> {
        let cutoff = recent.len().saturating_sub(keep_recent);
        recent[..cutoff]
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect()
    }

    /// Run one pass
    pub async fn run(
        &self,
        options: PassOptions,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<PassOutcome, PipelineError> {
        let timer = METRICS.pipeline_duration.start_timer();
        let result = self.run_stages(&options, progress, cancel).await;
        timer.observe_duration();

        let outcome = match &result {
            Ok(PassOutcome::Compressed(_)) => "compressed",
            Ok(PassOutcome::Skipped { .. }) => "skipped",
            Err(e) => e.reason(),
        };
        METRICS
            .compression_passes
            .with_label_values(&[outcome])
            .inc();
        result
    }

    async fn run_stages(
        &self,
        options: &PassOptions,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<PassOutcome, PipelineError> {
        let report = |stage: PipelineStage| {
            debug!("Compression stage {}", stage);
            progress.report(ProgressEvent {
                stage,
                percent: stage.percent(),
            });
        };

        // Stage 1: identify
        report(PipelineStage::Identify);
        let (selected, total_before) = {
            let store = self.store.read().await;
            (
                self.identify(store.recent_messages(), options.keep_recent),
                store.token_count().total,
            )
        };
        if selected.len() < self.config.min_messages {
            debug!(
                "Only {} messages qualify for compression, skipping",
                selected.len()
            );
            report(PipelineStage::Complete);
            return Ok(PassOutcome::Skipped {
                qualifying: selected.len(),
            });
        }

        // Stage 2: prepare
        report(PipelineStage::Prepare);
        let original_tokens: usize = selected.iter().map(|m| m.token_count).sum();
        let level = self.select_level(original_tokens);
        let source_ids: Vec<String> = selected.iter().map(|m| m.id.clone()).collect();
        info!(
            "Compressing {} messages ({} tokens) at level {}",
            selected.len(),
            original_tokens,
            level
        );

        // Stage 3: summarize, with no lock held
        report(PipelineStage::Summarize);
        let request = SummaryRequest::from_messages(&selected, level)
            .with_goal(options.goal.clone())
            .fail_fast(options.fail_fast);
        let summary = self.summarizer.summarize(request, cancel).await?;

        // Stage 4: create checkpoint
        report(PipelineStage::CreateCheckpoint);
        let compression_ratio = ratio(summary.token_count, original_tokens);
        if compression_ratio >= 1.0 {
            warn!(
                "Rejecting checkpoint: {} tokens from {} original",
                summary.token_count, original_tokens
            );
            return Err(PipelineError::NotCompressing {
                ratio: compression_ratio,
            });
        }
        let checkpoint = CheckpointSummary {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            summary_text: summary.text,
            source_message_ids: source_ids,
            token_count: summary.token_count,
            original_tokens,
            level,
            compression_generation: options.generation,
            merged: false,
        };
        self.history
            .lock()
            .await
            .record_checkpoint(CheckpointRecord::for_checkpoint(
                &checkpoint,
                RecordKind::Compression,
            ))
            .await?;

        // Stages 5 and 6 under the write lock; readers see before or after
        let mut store = self.store.write().await;
        if !store.contains_messages(&checkpoint.source_message_ids) {
            return Err(PipelineError::StaleSelection);
        }

        report(PipelineStage::UpdateContext);
        let mut staged = store.clone();
        let checkpoint_id = checkpoint.id.clone();
        let compressed_tokens = checkpoint.token_count;
        let source_count = checkpoint.source_message_ids.len();
        staged.apply_compression(checkpoint);

        report(PipelineStage::Validate);
        let total = staged.prompt_tokens();
        let limit = staged.provider_limit();
        if total > limit {
            warn!(
                "Context still over provider limit after compression: {} > {}",
                total, limit
            );
            return Err(PipelineError::ExceedsProviderLimit { total, limit });
        }

        *store = staged;
        drop(store);

        if let Err(e) = self.history.lock().await.mark_compression_committed().await {
            warn!("Failed to persist compression count: {}", e);
        }

        METRICS.compression_ratio.observe(compression_ratio);
        report(PipelineStage::Complete);
        info!(
            "Checkpoint {} committed: {} -> {} tokens (ratio {:.3}), context now {} tokens",
            checkpoint_id, original_tokens, compressed_tokens, compression_ratio, total
        );

        Ok(PassOutcome::Compressed(PassReport {
            checkpoint_id,
            source_count,
            original_tokens,
            compressed_tokens,
            compression_ratio,
            level,
            freed_tokens: total_before.saturating_sub(total),
            total_tokens: total,
        }))
    }
}
