//! Token estimation

use super::ProviderError;
use crate::config::TokenizerKind;
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }
}

/// Tiktoken-based estimator using cl100k_base
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    pub fn new() -> Result<Self, ProviderError> {
        let bpe = cl100k_base().map_err(|e| ProviderError::Tokenizer(e.to_string()))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Word-based estimator, a multiple of the whitespace word count
#[derive(Debug, Clone, Copy)]
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }
}

/// Build the configured estimator
///
/// Falls back to word counting when the BPE tables cannot be loaded.
pub fn estimator_for(kind: TokenizerKind) -> Arc<dyn TokenEstimator> {
    match kind {
        TokenizerKind::Tiktoken => match TiktokenEstimator::new() {
            Ok(estimator) => Arc::new(estimator),
            Err(e) => {
                warn!("Tiktoken unavailable ({}), falling back to word counts", e);
                Arc::new(WordBasedEstimator::default())
            }
        },
        TokenizerKind::Words => Arc::new(WordBasedEstimator::default()),
    }
}
