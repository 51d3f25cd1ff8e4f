//! Active context store
//!
//! Holds what will be sent to the model on the next turn: the system prompt,
//! checkpoint summaries in generation order, and the recent messages. Token
//! totals are recomputed from per-item counts after every mutation.

use super::models::{ActiveContext, CheckpointSummary, Message, Role, TokenCount};
use super::tier::{BudgetError, ContextBudget};
use crate::provider::{ChatMessage, TokenEstimator};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// In-memory active context with token accounting
#[derive(Clone)]
pub struct ActiveContextStore {
    context: ActiveContext,
    budget: ContextBudget,
    threshold: usize,
    estimator: Arc<dyn TokenEstimator>,
}

impl fmt::Debug for ActiveContextStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveContextStore")
            .field("context", &self.context)
            .field("budget", &self.budget)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl ActiveContextStore {
    /// Create a store around a system prompt
    ///
    /// Fails when the system prompt alone leaves no room under the budget.
    pub fn new(
        system_prompt: impl Into<String>,
        budget: ContextBudget,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self, BudgetError> {
        let mut prompt = Message::system(system_prompt);
        prompt.token_count = estimator.estimate(&prompt.content);
        let threshold = budget.compression_threshold(prompt.token_count)?;

        Ok(Self {
            context: ActiveContext::new(prompt),
            budget,
            threshold,
            estimator,
        })
    }

    pub fn context(&self) -> &ActiveContext {
        &self.context
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    pub fn token_count(&self) -> TokenCount {
        self.context.token_count
    }

    /// Conversation size at which compression is due
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn provider_limit(&self) -> usize {
        self.budget.provider_limit
    }

    /// Fraction of the provider limit used by the whole context
    pub fn usage_fraction(&self) -> f64 {
        self.budget.usage_fraction(self.context.token_count.total)
    }

    /// Whether the conversation part of the context is over the threshold
    pub fn over_threshold(&self) -> bool {
        self.context.token_count.conversation() > self.threshold
    }

    pub fn checkpoints(&self) -> &[CheckpointSummary] {
        &self.context.checkpoints
    }

    pub fn recent_messages(&self) -> &[Message] {
        &self.context.recent_messages
    }

    /// Count tokens with the session's estimator
    pub fn count_tokens(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    /// Append a message; returns whether the threshold is now exceeded
    pub fn add_message(&mut self, mut message: Message) -> bool {
        message.token_count = self.estimator.estimate(&message.content);
        debug!(
            "Adding {} message {} ({} tokens)",
            message.role, message.id, message.token_count
        );
        self.context.recent_messages.push(message);
        self.context.recompute_tokens();
        self.over_threshold()
    }

    /// Insert a checkpoint, keeping generation order
    pub fn add_checkpoint(&mut self, checkpoint: CheckpointSummary) {
        let position = self
            .context
            .checkpoints
            .iter()
            .position(|c| c.compression_generation > checkpoint.compression_generation)
            .unwrap_or(self.context.checkpoints.len());
        self.context.checkpoints.insert(position, checkpoint);
        self.context.recompute_tokens();
    }

    /// Remove recent messages by id; returns how many were removed
    pub fn remove_messages(&mut self, ids: &[String]) -> usize {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let before = self.context.recent_messages.len();
        self.context
            .recent_messages
            .retain(|m| !ids.contains(m.id.as_str()));
        self.context.recompute_tokens();
        before - self.context.recent_messages.len()
    }

    /// Whether every id still names a recent message
    pub fn contains_messages(&self, ids: &[String]) -> bool {
        let present: HashSet<&str> = self
            .context
            .recent_messages
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        ids.iter().all(|id| present.contains(id.as_str()))
    }

    /// Swap source messages for the checkpoint that summarizes them
    pub fn apply_compression(&mut self, checkpoint: CheckpointSummary) {
        self.remove_messages(&checkpoint.source_message_ids);
        self.add_checkpoint(checkpoint);
    }

    /// Replace one checkpoint in place; returns false if it is gone
    pub fn replace_checkpoint(&mut self, id: &str, replacement: CheckpointSummary) -> bool {
        match self.context.checkpoints.iter_mut().find(|c| c.id == id) {
            Some(slot) => {
                *slot = replacement;
                self.context.recompute_tokens();
                true
            }
            None => false,
        }
    }

    /// Retire several checkpoints in favour of one merged checkpoint
    pub fn replace_checkpoints(&mut self, ids: &[String], merged: CheckpointSummary) -> bool {
        let has_all = ids
            .iter()
            .all(|id| self.context.checkpoints.iter().any(|c| &c.id == id));
        if !has_all {
            return false;
        }
        self.context.checkpoints.retain(|c| !ids.contains(&c.id));
        self.add_checkpoint(merged);
        true
    }

    /// Replace the system prompt, re-deriving the threshold
    pub fn set_system_prompt(&mut self, text: impl Into<String>) -> Result<(), BudgetError> {
        let mut prompt = Message::system(text);
        prompt.token_count = self.estimator.estimate(&prompt.content);
        self.threshold = self.budget.compression_threshold(prompt.token_count)?;
        self.context.system_prompt = prompt;
        self.context.recompute_tokens();
        Ok(())
    }

    /// Switch to a new budget (model change)
    pub fn set_budget(&mut self, budget: ContextBudget) -> Result<(), BudgetError> {
        self.threshold = budget.compression_threshold(self.context.token_count.system)?;
        self.budget = budget;
        Ok(())
    }

    /// Keep only the newest `keep` recent messages; returns what was dropped
    pub fn truncate_recent(&mut self, keep: usize) -> Vec<Message> {
        let len = self.context.recent_messages.len();
        let dropped = if len > keep {
            self.context.recent_messages.drain(..len - keep).collect()
        } else {
            Vec::new()
        };
        self.context.recompute_tokens();
        dropped
    }

    /// Replace the whole context (snapshot restore)
    pub fn restore(&mut self, mut context: ActiveContext) -> Result<(), BudgetError> {
        context.recompute_tokens();
        self.threshold = self
            .budget
            .compression_threshold(context.token_count.system)?;
        self.context = context;
        Ok(())
    }

    /// Ordered prompt: system, checkpoints as assistant turns, recent messages
    pub fn build_prompt(&self) -> Vec<ChatMessage> {
        let mut prompt = Vec::with_capacity(
            1 + self.context.checkpoints.len() + self.context.recent_messages.len(),
        );
        prompt.push(ChatMessage::new(
            Role::System,
            self.context.system_prompt.content.clone(),
        ));
        prompt.extend(
            self.context
                .checkpoints
                .iter()
                .map(|c| ChatMessage::new(Role::Assistant, c.summary_text.clone())),
        );
        prompt.extend(
            self.context
                .recent_messages
                .iter()
                .map(|m| ChatMessage::new(m.role, m.content.clone())),
        );
        prompt
    }

    /// Token count of the built prompt, counted afresh
    pub fn prompt_tokens(&self) -> usize {
        let prompt = self.build_prompt();
        let texts: Vec<&str> = prompt.iter().map(|m| m.content.as_str()).collect();
        self.estimator.estimate_batch(&texts).into_iter().sum()
    }
}
