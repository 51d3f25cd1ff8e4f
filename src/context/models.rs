//! Data models for context management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single conversation message
///
/// `token_count` is filled in by the active context store when the message
/// enters it; nothing else mutates a message after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub token_count: usize,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            token_count: 0,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }
}

/// Summary detail level. Lower is more compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Compact = 1,
    Moderate = 2,
    Detailed = 3,
}

impl CompressionLevel {
    /// Target summary size in tokens
    pub fn target_range(&self) -> (usize, usize) {
        match self {
            Self::Compact => (50, 100),
            Self::Moderate => (150, 300),
            Self::Detailed => (300, 500),
        }
    }

    /// Hard ceiling a summary at this level must not exceed
    pub fn ceiling(&self) -> usize {
        self.target_range().1
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Moderate => "moderate",
            Self::Detailed => "detailed",
        }
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.as_u8())
    }
}

/// A model-generated summary standing in for older messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub summary_text: String,
    /// Ids of the messages this checkpoint replaced
    pub source_message_ids: Vec<String>,
    pub token_count: usize,
    /// Token count of the content this checkpoint was built from
    pub original_tokens: usize,
    pub level: CompressionLevel,
    pub compression_generation: u32,
    pub merged: bool,
}

impl CheckpointSummary {
    /// Age relative to the session's current generation
    pub fn age(&self, current_generation: u32) -> u32 {
        current_generation.saturating_sub(self.compression_generation)
    }

    pub fn compression_ratio(&self) -> f64 {
        ratio(self.token_count, self.original_tokens)
    }
}

pub(crate) fn ratio(compressed: usize, original: usize) -> f64 {
    if original == 0 {
        return 1.0;
    }
    compressed as f64 / original as f64
}

/// How a checkpoint record came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Compression,
    Aged,
    Merged,
}

/// Range of messages covered by a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRange {
    pub first_id: String,
    pub last_id: String,
    pub count: usize,
}

impl MessageRange {
    pub fn from_ids(ids: &[String]) -> Self {
        Self {
            first_id: ids.first().cloned().unwrap_or_default(),
            last_id: ids.last().cloned().unwrap_or_default(),
            count: ids.len(),
        }
    }
}

/// Durable, append-only record of a checkpoint creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub message_range: MessageRange,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub compression_ratio: f64,
    pub level: CompressionLevel,
    pub kind: RecordKind,
}

impl CheckpointRecord {
    pub fn for_checkpoint(checkpoint: &CheckpointSummary, kind: RecordKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            checkpoint_id: checkpoint.id.clone(),
            created_at: Utc::now(),
            message_range: MessageRange::from_ids(&checkpoint.source_message_ids),
            original_tokens: checkpoint.original_tokens,
            compressed_tokens: checkpoint.token_count,
            compression_ratio: checkpoint.compression_ratio(),
            level: checkpoint.level,
            kind,
        }
    }
}

/// Token accounting for the active context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCount {
    pub system: usize,
    pub checkpoints: usize,
    pub recent: usize,
    pub total: usize,
}

impl TokenCount {
    /// Tokens spent on conversation content (everything but the system prompt)
    pub fn conversation(&self) -> usize {
        self.checkpoints + self.recent
    }
}

/// What will be sent to the model on the next turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveContext {
    pub system_prompt: Message,
    /// Kept in generation order
    pub checkpoints: Vec<CheckpointSummary>,
    /// Chronological
    pub recent_messages: Vec<Message>,
    pub token_count: TokenCount,
}

impl ActiveContext {
    pub fn new(system_prompt: Message) -> Self {
        let mut context = Self {
            system_prompt,
            checkpoints: Vec::new(),
            recent_messages: Vec::new(),
            token_count: TokenCount::default(),
        };
        context.recompute_tokens();
        context
    }

    /// Rebuild token totals from the stored per-item counts
    pub fn recompute_tokens(&mut self) {
        let system = self.system_prompt.token_count;
        let checkpoints = self.checkpoints.iter().map(|c| c.token_count).sum();
        let recent = self.recent_messages.iter().map(|m| m.token_count).sum();
        self.token_count = TokenCount {
            system,
            checkpoints,
            recent,
            total: system + checkpoints + recent,
        };
    }
}

/// Per-session counters kept alongside the history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub token_count: usize,
    pub compression_count: usize,
}

/// Durable record of everything that happened in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHistory {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub checkpoint_records: Vec<CheckpointRecord>,
    pub metadata: SessionMetadata,
}

impl SessionHistory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            checkpoint_records: Vec::new(),
            metadata: SessionMetadata::default(),
        }
    }

    pub fn cursor(&self) -> HistoryCursor {
        HistoryCursor {
            message_count: self.messages.len(),
            checkpoint_record_count: self.checkpoint_records.len(),
        }
    }
}

/// Position in the session history at the time a snapshot was taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    pub message_count: usize,
    pub checkpoint_record_count: usize,
}

/// Why a snapshot was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotReason {
    Checkpoint,
    Manual,
    /// State discarded by an emergency rollover, kept for recovery
    Rollover,
    /// State left after an emergency rollover
    Truncation,
}

impl SnapshotReason {
    /// Whether a resumed session may start from this snapshot
    ///
    /// A rollover snapshot holds the over-limit state that was truncated.
    pub fn is_resume_base(self) -> bool {
        !matches!(self, SnapshotReason::Rollover)
    }
}

const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Immutable, restorable copy of the active context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub active_context: ActiveContext,
    pub history_cursor: HistoryCursor,
    pub ttl_secs: u64,
    pub reason: SnapshotReason,
    /// Hex SHA-256 of the encoded active context
    pub checksum: String,
}

impl Snapshot {
    pub fn expires_at(&self) -> DateTime<Utc> {
        // chrono durations are bounded; a century is effectively forever here
        let secs = self.ttl_secs.min(MAX_TTL_SECS) as i64;
        let ttl = chrono::Duration::seconds(secs);
        self.created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Number of recent messages captured
    pub fn message_count(&self) -> usize {
        self.active_context.recent_messages.len()
    }
}

/// Conversation goal used to steer summaries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub description: String,
    /// Names (files, components, people) a summary should preserve
    #[serde(default)]
    pub key_entities: Vec<String>,
}

impl Goal {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            key_entities: Vec::new(),
        }
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_entities = entities.into_iter().map(Into::into).collect();
        self
    }
}
