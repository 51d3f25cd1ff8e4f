//! OpenAI-compatible streaming chat provider
//!
//! Talks to a local model server (Ollama, llama.cpp, vLLM) over the
//! `/v1/chat/completions` endpoint with `stream: true` and decodes the
//! server-sent events into [`StreamChunk`]s.

use super::{
    estimator_for, ChatMessage, ChatRequest, ChatStream, FinishReason, ModelProvider,
    ProviderError, StreamChunk, TokenEstimator,
};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DONE_SENTINEL: &str = "[DONE]";

/// Streaming provider for OpenAI-compatible servers
pub struct HttpChatProvider {
    client: Client,
    config: ProviderConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl HttpChatProvider {
    /// Create a provider using the configured tokenizer
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let estimator = estimator_for(config.tokenizer);
        Self::with_estimator(config, estimator)
    }

    /// Create a provider with an explicit token estimator
    pub fn with_estimator(
        config: ProviderConfig,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ProviderError::Initialization(e.to_string()))?;

        Ok(Self {
            client,
            config,
            estimator,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl ModelProvider for HttpChatProvider {
    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ProviderError> {
        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
        };

        debug!(
            "Streaming chat completion: {} messages, model {}",
            request.messages.len(),
            self.config.model
        );

        let mut req = self.client.post(&self.config.endpoint).json(&body);
        if let Some(ref api_key) = self.config.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = req.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Chat completion failed: HTTP {}", status);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let state = StreamState {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            cancel,
            finish_reason: None,
            finished: false,
        };
        Ok(stream::unfold(state, next_chunk).boxed())
    }

    fn estimator(&self) -> Arc<dyn TokenEstimator> {
        Arc::clone(&self.estimator)
    }
}

struct StreamState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<StreamChunk>,
    cancel: CancellationToken,
    finish_reason: Option<FinishReason>,
    finished: bool,
}

impl StreamState {
    fn fail(mut self, error: ProviderError) -> Option<(Result<StreamChunk, ProviderError>, Self)> {
        self.finished = true;
        Some((Err(error), self))
    }

    fn handle_event(&mut self, data: &str) -> Result<(), ProviderError> {
        if data == DONE_SENTINEL {
            let finish_reason = self.finish_reason.take().unwrap_or(FinishReason::Stop);
            self.pending.push_back(StreamChunk::Done { finish_reason });
            return Ok(());
        }

        let event: ChatCompletionChunk = serde_json::from_str(data)
            .map_err(|e| ProviderError::Stream(format!("invalid event payload: {}", e)))?;

        for choice in event.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.pending.push_back(StreamChunk::Text(content));
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(FinishReason::parse(&reason));
            }
        }
        Ok(())
    }
}

async fn next_chunk(
    mut state: StreamState,
) -> Option<(Result<StreamChunk, ProviderError>, StreamState)> {
    loop {
        if state.finished {
            return None;
        }

        if let Some(chunk) = state.pending.pop_front() {
            if matches!(chunk, StreamChunk::Done { .. }) {
                state.finished = true;
            }
            return Some((Ok(chunk), state));
        }

        let next = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => return state.fail(ProviderError::Cancelled),
            next = state.body.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                let events = match state.decoder.feed(&bytes) {
                    Ok(events) => events,
                    Err(e) => return state.fail(e),
                };
                for data in events {
                    if let Err(e) = state.handle_event(&data) {
                        return state.fail(e);
                    }
                }
            }
            Some(Err(e)) => return state.fail(e.into()),
            None => {
                // Some servers close the stream without the sentinel
                return match state.finish_reason.take() {
                    Some(finish_reason) => {
                        state.finished = true;
                        Some((Ok(StreamChunk::Done { finish_reason }), state))
                    }
                    None => state.fail(ProviderError::Stream(
                        "stream ended before completion".to_string(),
                    )),
                };
            }
        }
    }
}

/// Incremental server-sent events decoder
///
/// Yields the `data` payload of each complete event. Bytes are buffered
/// until a full line is available so multi-byte characters split across
/// network chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, ProviderError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = std::str::from_utf8(&line)
                .map_err(|e| ProviderError::Stream(format!("invalid UTF-8: {}", e)))?;
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }

        Ok(events)
    }
}

// OpenAI-compatible wire types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}
