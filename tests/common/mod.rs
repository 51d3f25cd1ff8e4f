//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use context_engine::context::{ContextOrchestrator, SessionDeps};
use context_engine::provider::{
    ChatRequest, ChatStream, FinishReason, ModelProvider, ProviderError, StreamChunk,
    TokenEstimator, WordBasedEstimator,
};
use bytes::Bytes;
use context_engine::storage::{BlobKind, BlobStore, MemoryBlobStore, StorageError, StorageKey};
use context_engine::Config;
use futures::stream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// `n` distinct words; one token each under the test estimator
pub fn words(n: usize) -> String {
    (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
}

/// Provider that answers every call with the same summary, or fails
pub struct FixedProvider {
    reply: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedProvider {
    pub fn replying(words_in_reply: usize) -> Self {
        Self {
            reply: Some(words(words_in_reply)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for FixedProvider {
    async fn chat_stream(
        &self,
        _request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            }
        }

        let Some(text) = self.reply.clone() else {
            return Err(ProviderError::Api {
                status: 500,
                body: "model crashed".to_string(),
            });
        };
        let chunks = vec![
            Ok(StreamChunk::Text(text)),
            Ok(StreamChunk::Done {
                finish_reason: FinishReason::Stop,
            }),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }

    fn estimator(&self) -> Arc<dyn TokenEstimator> {
        Arc::new(WordBasedEstimator::new(1.0))
    }
}

/// In-memory store whose writes of chosen kinds fail
#[derive(Default)]
pub struct FaultyBlobStore {
    inner: MemoryBlobStore,
    failing: Mutex<Vec<BlobKind>>,
    rejected: AtomicUsize,
}

impl FaultyBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, kind: BlobKind) {
        self.failing.lock().unwrap().push(kind);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FaultyBlobStore {
    async fn put(&self, key: &StorageKey, value: Bytes) -> Result<(), StorageError> {
        if self.failing.lock().unwrap().contains(&key.kind) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Backend(format!("disk full writing {}", key)));
        }
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<Bytes>, StorageError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn list(&self, session_id: &str, kind: BlobKind) -> Result<Vec<String>, StorageError> {
        self.inner.list(session_id, kind).await
    }
}

/// 8192-token window: provider limit 6963, threshold 3347 with a 500-token
/// system prompt
pub fn config() -> Config {
    let mut config = Config::default();
    config.provider.context_window = 8192;
    config
}

pub struct Session {
    pub orchestrator: ContextOrchestrator,
    pub provider: Arc<FixedProvider>,
    pub blobs: Arc<dyn BlobStore>,
}

pub async fn start(provider: FixedProvider) -> Session {
    start_with(provider, config()).await
}

pub async fn start_with(provider: FixedProvider, config: Config) -> Session {
    start_on(provider, Arc::new(MemoryBlobStore::new()), config).await
}

pub async fn start_on(provider: FixedProvider, blobs: Arc<dyn BlobStore>, config: Config) -> Session {
    let provider = Arc::new(provider);
    let deps = SessionDeps::new(provider.clone(), Arc::clone(&blobs));
    let orchestrator = ContextOrchestrator::start("session-1", words(500), config, deps)
        .await
        .unwrap();
    Session {
        orchestrator,
        provider,
        blobs,
    }
}
