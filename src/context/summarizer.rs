//! Model-backed summarization for checkpoint creation and aging
//!
//! A summary is only returned once it passes validation: non-empty, within
//! the hard ceiling for its level, generated to completion, and (when a
//! goal is given) naming at least one of the goal's entities that appear in
//! the source. A failed attempt is retried once with a stricter instruction;
//! raw or truncated text is never passed off as a summary.

use super::models::{CompressionLevel, Goal, Message, Role};
use crate::config::SummarizerConfig;
use crate::metrics::METRICS;
use crate::provider::{
    ChatMessage, ChatRequest, FinishReason, ModelProvider, ProviderError, StreamChunk,
    TokenEstimator,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SYSTEM_INSTRUCTION: &str = "You compress conversation history into checkpoint summaries. \
Preserve decisions, facts, open tasks and the names of files, components and people. \
Reply with the summary text only.";

/// Input to one summarization call
#[derive(Debug, Clone)]
pub struct SummaryRequest {
    /// Text segments, oldest first
    pub segments: Vec<String>,
    pub level: CompressionLevel,
    pub goal: Option<Goal>,
    /// Skip the retry after a failed attempt
    pub fail_fast: bool,
}

impl SummaryRequest {
    /// Summarize conversation messages, one segment per turn
    pub fn from_messages(messages: &[Message], level: CompressionLevel) -> Self {
        let segments = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect();
        Self::from_texts(segments, level)
    }

    /// Summarize free text (existing checkpoint summaries)
    pub fn from_texts(segments: Vec<String>, level: CompressionLevel) -> Self {
        Self {
            segments,
            level,
            goal: None,
            fail_fast: false,
        }
    }

    pub fn with_goal(mut self, goal: Option<Goal>) -> Self {
        self.goal = goal;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Goal entities that occur somewhere in the source text
    fn entities_in_source(&self) -> Vec<&str> {
        let Some(goal) = &self.goal else {
            return Vec::new();
        };
        let source = self.segments.join("\n").to_lowercase();
        goal.key_entities
            .iter()
            .map(String::as_str)
            .filter(|e| !e.is_empty() && source.contains(&e.to_lowercase()))
            .collect()
    }
}

/// Validated summary
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub text: String,
    pub token_count: usize,
    pub level: CompressionLevel,
    pub attempts: u32,
}

/// Why a single attempt was rejected
#[derive(Debug, Error)]
pub enum AttemptFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("model returned an empty summary")]
    Empty,

    #[error("summary has {tokens} tokens, ceiling is {ceiling}")]
    OverCeiling { tokens: usize, ceiling: usize },

    #[error("summary was cut off at the length limit")]
    Truncated,

    #[error("summary omits all goal entities ({0})")]
    MissingEntities(String),
}

impl AttemptFailure {
    /// Whether a second, stricter attempt is worth making
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::Timeout(_)
            | Self::Empty
            | Self::OverCeiling { .. }
            | Self::Truncated
            | Self::MissingEntities(_) => true,
        }
    }
}

/// Summarization errors
#[derive(Debug, Error)]
pub enum SummarizerError {
    #[error("Summarization failed after {attempts} attempt(s): {last}")]
    Failed {
        attempts: u32,
        #[source]
        last: AttemptFailure,
    },

    #[error("Summarization cancelled")]
    Cancelled,

    #[error("Nothing to summarize")]
    EmptyInput,
}

/// Summarizer trait for different summarization strategies
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        request: SummaryRequest,
        cancel: CancellationToken,
    ) -> Result<Summary, SummarizerError>;
}

/// Summarizer that asks the session's model
pub struct SummarizationService {
    provider: Arc<dyn ModelProvider>,
    estimator: Arc<dyn TokenEstimator>,
    config: SummarizerConfig,
}

impl SummarizationService {
    pub fn new(provider: Arc<dyn ModelProvider>, config: SummarizerConfig) -> Self {
        let estimator = provider.estimator();
        Self {
            provider,
            estimator,
            config,
        }
    }

    /// Build the chat request for an attempt
    fn build_request(&self, request: &SummaryRequest, rejection: Option<&AttemptFailure>) -> ChatRequest {
        let (low, high) = request.level.target_range();
        let mut prompt = match request.level {
            CompressionLevel::Compact => format!(
                "Write a compact summary of {}-{} tokens keeping only outcomes and open items.",
                low, high
            ),
            CompressionLevel::Moderate => format!(
                "Write a summary of {}-{} tokens covering the main points and decisions.",
                low, high
            ),
            CompressionLevel::Detailed => format!(
                "Write a detailed summary of {}-{} tokens. Keep specific values, names and reasoning.",
                low, high
            ),
        };

        if let Some(goal) = &request.goal {
            prompt.push_str(&format!("\nThe conversation goal is: {}", goal.description));
            if !goal.key_entities.is_empty() {
                prompt.push_str(&format!(
                    "\nMention these by name where relevant: {}",
                    goal.key_entities.join(", ")
                ));
            }
        }

        if let Some(rejection) = rejection {
            prompt.push_str(&format!(
                "\nA previous summary was rejected ({}). Be more concise: stay under {} tokens.",
                rejection, low
            ));
        }

        prompt.push_str("\n\n");
        prompt.push_str(&request.segments.join("\n\n---\n\n"));

        ChatRequest {
            messages: vec![
                ChatMessage::new(Role::System, SYSTEM_INSTRUCTION),
                ChatMessage::new(Role::User, prompt),
            ],
            max_tokens: Some(high),
            temperature: Some(self.config.temperature),
        }
    }

    /// Stream one completion to the end
    async fn collect(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<(String, FinishReason), ProviderError> {
        let mut stream = self.provider.chat_stream(request, cancel.clone()).await?;
        let mut text = String::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(StreamChunk::Text(delta))) => text.push_str(&delta),
                Some(Ok(StreamChunk::Done { finish_reason })) => return Ok((text, finish_reason)),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ProviderError::Stream(
                        "stream ended without a finish reason".to_string(),
                    ))
                }
            }
        }
    }

    fn validate(
        &self,
        request: &SummaryRequest,
        text: &str,
        finish_reason: &FinishReason,
    ) -> Result<usize, AttemptFailure> {
        if *finish_reason == FinishReason::Length {
            return Err(AttemptFailure::Truncated);
        }
        if text.is_empty() {
            return Err(AttemptFailure::Empty);
        }

        let tokens = self.estimator.estimate(text);
        let ceiling = request.level.ceiling();
        if tokens == 0 {
            return Err(AttemptFailure::Empty);
        }
        if tokens > ceiling {
            return Err(AttemptFailure::OverCeiling { tokens, ceiling });
        }

        let entities = request.entities_in_source();
        if !entities.is_empty() {
            let lowered = text.to_lowercase();
            if !entities.iter().any(|e| lowered.contains(&e.to_lowercase())) {
                return Err(AttemptFailure::MissingEntities(entities.join(", ")));
            }
        }

        Ok(tokens)
    }

    async fn attempt(
        &self,
        request: &SummaryRequest,
        rejection: Option<&AttemptFailure>,
        cancel: &CancellationToken,
    ) -> Result<Summary, AttemptFailure> {
        let chat = self.build_request(request, rejection);
        let timeout = self.config.timeout();

        let (text, finish_reason) =
            match tokio::time::timeout(timeout, self.collect(chat, cancel.clone())).await {
                Ok(result) => result?,
                Err(_) => return Err(AttemptFailure::Timeout(timeout)),
            };

        let text = text.trim().to_string();
        let token_count = self.validate(request, &text, &finish_reason)?;
        Ok(Summary {
            text,
            token_count,
            level: request.level,
            attempts: 0,
        })
    }
}

#[async_trait]
impl Summarizer for SummarizationService {
    async fn summarize(
        &self,
        request: SummaryRequest,
        cancel: CancellationToken,
    ) -> Result<Summary, SummarizerError> {
        if request.segments.iter().all(|s| s.trim().is_empty()) {
            return Err(SummarizerError::EmptyInput);
        }

        let max_attempts = if request.fail_fast || !self.config.retry_on_failure {
            1
        } else {
            2
        };

        debug!(
            "Summarizing {} segments at level {}, up to {} attempt(s)",
            request.segments.len(),
            request.level,
            max_attempts
        );

        let mut last: Option<AttemptFailure> = None;
        let mut attempts = 0;
        while attempts < max_attempts {
            attempts += 1;
            match self.attempt(&request, last.as_ref(), &cancel).await {
                Ok(mut summary) => {
                    summary.attempts = attempts;
                    METRICS
                        .summarizations
                        .with_label_values(&["success"])
                        .inc();
                    return Ok(summary);
                }
                Err(AttemptFailure::Provider(ProviderError::Cancelled)) => {
                    METRICS
                        .summarizations
                        .with_label_values(&["cancelled"])
                        .inc();
                    return Err(SummarizerError::Cancelled);
                }
                Err(failure) => {
                    warn!("Summarization attempt {} rejected: {}", attempts, failure);
                    let retryable = failure.is_retryable();
                    last = Some(failure);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        METRICS
            .summarizations
            .with_label_values(&["failure"])
            .inc();

        Err(SummarizerError::Failed {
            attempts,
            last: last.unwrap_or(AttemptFailure::Empty),
        })
    }
}
