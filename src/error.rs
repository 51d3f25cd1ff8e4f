//! Error types for the context engine

use crate::context::pipeline::PipelineError;
use crate::context::summarizer::SummarizerError;
use crate::context::tier::BudgetError;
use crate::provider::ProviderError;
use crate::storage::StorageError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ContextError>;

/// Coarse error classification used when reporting failures to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientProvider,
    Validation,
    Storage,
    ConcurrencyRejection,
    Configuration,
    Internal,
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Summarizer(#[from] SummarizerError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Compression already in progress for session {0}")]
    CompressionInFlight(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContextError {
    /// Map onto the engine's failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Budget(BudgetError::BudgetExceeded { .. }) => ErrorKind::Validation,
            Self::Configuration(_) | Self::Budget(_) => ErrorKind::Configuration,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Provider(e) if e.is_transient() => ErrorKind::TransientProvider,
            Self::Provider(_) => ErrorKind::Internal,
            Self::Summarizer(_) => ErrorKind::TransientProvider,
            Self::Pipeline(e) => e.kind(),
            Self::CompressionInFlight(_) => ErrorKind::ConcurrencyRejection,
            Self::SnapshotNotFound(_) => ErrorKind::Validation,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<config::ConfigError> for ContextError {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}
