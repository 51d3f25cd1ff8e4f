//! Context management with token budget enforcement
//!
//! The active context (system prompt, checkpoint summaries, recent messages)
//! is kept under a tier-derived budget by compressing older messages into
//! checkpoints, aging those checkpoints over time, and falling back to
//! emergency compression or a snapshot-backed rollover when usage spikes.

pub mod active;
pub mod aging;
pub mod emergency;
pub mod history;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod snapshots;
pub mod summarizer;
pub mod tier;

pub use active::ActiveContextStore;
pub use aging::{AgingReport, CheckpointLifecycle};
pub use emergency::{EmergencyAction, EmergencyLadder, UsageLevel};
pub use history::SessionHistoryLog;
pub use models::{
    ActiveContext, CheckpointRecord, CheckpointSummary, CompressionLevel, Goal, HistoryCursor,
    Message, MessageRange, RecordKind, Role, SessionHistory, SessionMetadata, Snapshot,
    SnapshotReason, TokenCount,
};
pub use orchestrator::{
    AddMessageResult, CompressResult, ContextOrchestrator, EmergencyResult, ErrorReport,
    OperationResult, SessionDeps, SnapshotResult, SystemPromptBuilder, Usage,
};
pub use pipeline::{
    CompressionPipeline, NoopProgress, PassOptions, PassOutcome, PassReport, PipelineError,
    PipelineStage, ProgressEvent, ProgressSink,
};
pub use snapshots::SnapshotManager;
pub use summarizer::{SummarizationService, Summarizer, SummarizerError, Summary, SummaryRequest};
pub use tier::{BudgetError, ContextBudget, ContextTier, TierBudget, TierPolicy};
