//! Context-budget and compression engine for long-running LLM conversations
//!
//! A session keeps the prompt sent to a local model under a budget derived
//! from the model's context window. Older messages are replaced by
//! model-written checkpoint summaries, and snapshots of the active context
//! make emergency truncation recoverable.

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod storage;

pub use config::Config;
pub use error::{ContextError, ErrorKind, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::{
        AddMessageResult, CheckpointSummary, ContextOrchestrator, ContextTier, EmergencyAction,
        Goal, Message, Role, SessionDeps, Snapshot, TokenCount, UsageLevel,
    };
    pub use crate::error::{ContextError, ErrorKind, Result};
    pub use crate::provider::{HttpChatProvider, ModelProvider, TokenEstimator};
    pub use crate::storage::{open_store, BlobStore, FileBlobStore, MemoryBlobStore};
}
