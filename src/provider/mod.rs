//! Model provider contract
//!
//! The engine talks to the model server through [`ModelProvider`]: a
//! streaming chat call that honours a cancellation token, and a token
//! estimator used for all budget accounting.

pub mod estimator;
pub mod http;

pub use estimator::{estimator_for, TiktokenEstimator, TokenEstimator, WordBasedEstimator};
pub use http::HttpChatProvider;

use crate::context::models::Role;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One prompt turn sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Chat request
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

/// Why the model stopped generating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "stop" | "eos" | "end_turn" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Item yielded by a chat stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Text(String),
    Done { finish_reason: FinishReason },
}

pub type ChatStream = BoxStream<'static, Result<StreamChunk, ProviderError>>;

/// Provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Malformed stream: {0}")]
    Stream(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Initialization error: {0}")]
    Initialization(String),
}

impl ProviderError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::Stream(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Cancelled | Self::Tokenizer(_) | Self::Initialization(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Streaming chat model
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Start a streaming chat completion
    ///
    /// The returned stream ends after a [`StreamChunk::Done`]. Implementations
    /// stop producing chunks and yield [`ProviderError::Cancelled`] once
    /// `cancel` fires.
    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ProviderError>;

    /// Token counter matching this model
    fn estimator(&self) -> Arc<dyn TokenEstimator>;
}
