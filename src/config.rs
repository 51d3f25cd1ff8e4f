//! Engine configuration
//!
//! Settings are read once at session start. Sources are layered as
//! built-in defaults, then an optional TOML file, then environment
//! variables prefixed with `CONTEXT_ENGINE_` (nested keys separated by `__`,
//! e.g. `CONTEXT_ENGINE_COMPRESSION__KEEP_RECENT_COUNT=3`).

use crate::context::tier::{ContextTier, TierBudget};
use crate::error::{ContextError, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "CONTEXT_ENGINE";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub aging: AgingConfig,

    #[serde(default)]
    pub snapshots: SnapshotConfig,

    #[serde(default)]
    pub emergency: EmergencyConfig,

    #[serde(default)]
    pub summarizer: SummarizerConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env file is not an error
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overlay)
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;
        self.compression.validate()?;
        self.aging.validate()?;
        self.snapshots.validate()?;
        self.emergency.validate()?;

        if self.compression.emergency_keep_recent > self.compression.keep_recent_count {
            return Err(ContextError::Configuration(format!(
                "emergency_keep_recent ({}) must not exceed keep_recent_count ({})",
                self.compression.emergency_keep_recent, self.compression.keep_recent_count
            )));
        }

        if self.summarizer.timeout_secs == 0 {
            return Err(ContextError::Configuration(
                "summarizer.timeout_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if value <= 0.0 || value > 1.0 {
        return Err(ContextError::Configuration(format!(
            "{} must be in (0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

/// Tier budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Share of the advertised context window the provider may actually use
    #[serde(default = "default_provider_limit_fraction")]
    pub provider_limit_fraction: f64,

    /// Share of the available conversation budget that triggers compression
    #[serde(default = "default_threshold_fraction")]
    pub compression_threshold_fraction: f64,

    /// Per-tier replacements for the built-in prompt budget and safety margin,
    /// keyed by tier name (`tier_1_minimal` .. `tier_5_ultra`)
    #[serde(default)]
    pub tier_overrides: HashMap<String, TierBudget>,
}

fn default_provider_limit_fraction() -> f64 {
    0.85
}

fn default_threshold_fraction() -> f64 {
    0.75
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            provider_limit_fraction: default_provider_limit_fraction(),
            compression_threshold_fraction: default_threshold_fraction(),
            tier_overrides: HashMap::new(),
        }
    }
}

impl BudgetConfig {
    fn validate(&self) -> Result<()> {
        check_fraction("budget.provider_limit_fraction", self.provider_limit_fraction)?;
        check_fraction(
            "budget.compression_threshold_fraction",
            self.compression_threshold_fraction,
        )?;

        for name in self.tier_overrides.keys() {
            name.parse::<ContextTier>()?;
        }
        Ok(())
    }

    /// Override for a tier, if one is configured
    pub fn override_for(&self, tier: ContextTier) -> Option<&TierBudget> {
        self.tier_overrides.get(tier.as_str())
    }
}

/// Compression pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Most recent messages a normal pass never touches
    #[serde(default = "default_keep_recent")]
    pub keep_recent_count: usize,

    /// Most recent messages an emergency pass never touches
    #[serde(default = "default_emergency_keep_recent")]
    pub emergency_keep_recent: usize,

    /// Minimum number of qualifying messages for a pass to run
    #[serde(default = "default_min_messages")]
    pub min_messages: usize,

    /// Originals at or above this size are summarized at the compact level
    #[serde(default = "default_compact_from")]
    pub compact_from_tokens: usize,

    /// Originals at or above this size are summarized at the moderate level
    #[serde(default = "default_moderate_from")]
    pub moderate_from_tokens: usize,
}

fn default_keep_recent() -> usize {
    5
}

fn default_emergency_keep_recent() -> usize {
    2
}

fn default_min_messages() -> usize {
    2
}

fn default_compact_from() -> usize {
    3000
}

fn default_moderate_from() -> usize {
    2000
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            keep_recent_count: default_keep_recent(),
            emergency_keep_recent: default_emergency_keep_recent(),
            min_messages: default_min_messages(),
            compact_from_tokens: default_compact_from(),
            moderate_from_tokens: default_moderate_from(),
        }
    }
}

impl CompressionConfig {
    fn validate(&self) -> Result<()> {
        if self.min_messages < 2 {
            return Err(ContextError::Configuration(
                "compression.min_messages must be at least 2".to_string(),
            ));
        }
        if self.moderate_from_tokens > self.compact_from_tokens {
            return Err(ContextError::Configuration(format!(
                "compression.moderate_from_tokens ({}) must not exceed compact_from_tokens ({})",
                self.moderate_from_tokens, self.compact_from_tokens
            )));
        }
        Ok(())
    }
}

/// Checkpoint aging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgingConfig {
    #[serde(default = "default_aging_enabled")]
    pub enabled: bool,

    /// Generations after which a detailed checkpoint drops to moderate
    #[serde(default = "default_moderate_age")]
    pub moderate_age: u32,

    /// Generations after which a checkpoint drops to compact
    #[serde(default = "default_compact_age")]
    pub compact_age: u32,

    /// Generations after which checkpoints are merged together
    #[serde(default = "default_merge_age")]
    pub merge_age: u32,
}

fn default_aging_enabled() -> bool {
    true
}

fn default_moderate_age() -> u32 {
    2
}

fn default_compact_age() -> u32 {
    4
}

fn default_merge_age() -> u32 {
    6
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            enabled: default_aging_enabled(),
            moderate_age: default_moderate_age(),
            compact_age: default_compact_age(),
            merge_age: default_merge_age(),
        }
    }
}

impl AgingConfig {
    fn validate(&self) -> Result<()> {
        if self.moderate_age > self.compact_age || self.compact_age > self.merge_age {
            return Err(ContextError::Configuration(format!(
                "aging ages must be ascending: moderate {} <= compact {} <= merge {}",
                self.moderate_age, self.compact_age, self.merge_age
            )));
        }
        Ok(())
    }
}

/// Snapshot retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot time-to-live in seconds
    #[serde(default = "default_snapshot_ttl")]
    pub ttl_secs: u64,

    /// Maximum number of snapshots retained per session
    #[serde(default = "default_snapshot_max")]
    pub max_count: usize,

    /// Take a snapshot each time a checkpoint is committed
    #[serde(default = "default_snapshot_on_checkpoint")]
    pub on_checkpoint: bool,
}

fn default_snapshot_ttl() -> u64 {
    24 * 60 * 60
}

fn default_snapshot_max() -> usize {
    5
}

fn default_snapshot_on_checkpoint() -> bool {
    true
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_snapshot_ttl(),
            max_count: default_snapshot_max(),
            on_checkpoint: default_snapshot_on_checkpoint(),
        }
    }
}

impl SnapshotConfig {
    fn validate(&self) -> Result<()> {
        if self.max_count == 0 || self.ttl_secs == 0 {
            return Err(ContextError::Configuration(
                "snapshots.max_count and snapshots.ttl_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Usage fractions (of the provider limit) for each emergency rung
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    #[serde(default = "default_warning_fraction")]
    pub warning_fraction: f64,

    #[serde(default = "default_compression_fraction")]
    pub compression_fraction: f64,

    #[serde(default = "default_emergency_fraction")]
    pub emergency_fraction: f64,

    /// Messages kept by an emergency rollover
    #[serde(default = "default_rollover_keep")]
    pub rollover_keep_recent: usize,
}

fn default_warning_fraction() -> f64 {
    0.70
}

fn default_compression_fraction() -> f64 {
    0.80
}

fn default_emergency_fraction() -> f64 {
    0.95
}

fn default_rollover_keep() -> usize {
    1
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            warning_fraction: default_warning_fraction(),
            compression_fraction: default_compression_fraction(),
            emergency_fraction: default_emergency_fraction(),
            rollover_keep_recent: default_rollover_keep(),
        }
    }
}

impl EmergencyConfig {
    fn validate(&self) -> Result<()> {
        check_fraction("emergency.warning_fraction", self.warning_fraction)?;
        check_fraction("emergency.compression_fraction", self.compression_fraction)?;
        check_fraction("emergency.emergency_fraction", self.emergency_fraction)?;

        if !(self.warning_fraction <= self.compression_fraction
            && self.compression_fraction <= self.emergency_fraction)
        {
            return Err(ContextError::Configuration(
                "emergency fractions must be ascending: warning <= compression <= emergency"
                    .to_string(),
            ));
        }
        if self.rollover_keep_recent == 0 {
            return Err(ContextError::Configuration(
                "emergency.rollover_keep_recent must keep at least one message".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summarization service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Per-attempt timeout in seconds
    #[serde(default = "default_summarizer_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_summarizer_temperature")]
    pub temperature: f32,

    /// Retry once with a stricter instruction after a failed attempt
    #[serde(default = "default_summarizer_retry")]
    pub retry_on_failure: bool,
}

fn default_summarizer_timeout() -> u64 {
    60
}

fn default_summarizer_temperature() -> f32 {
    0.3
}

fn default_summarizer_retry() -> bool {
    true
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_summarizer_timeout(),
            temperature: default_summarizer_temperature(),
            retry_on_failure: default_summarizer_retry(),
        }
    }
}

impl SummarizerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tokenizer used for budget accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    Tiktoken,
    Words,
}

/// Model provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// OpenAI-compatible chat completions endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Bearer token, if the local server requires one
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Context window advertised by the model
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_tokenizer")]
    pub tokenizer: TokenizerKind,
}

fn default_endpoint() -> String {
    "http://localhost:11434/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_context_window() -> usize {
    8192
}

fn default_tokenizer() -> TokenizerKind {
    TokenizerKind::Tiktoken
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: None,
            connect_timeout_secs: default_connect_timeout(),
            context_window: default_context_window(),
            tokenizer: default_tokenizer(),
        }
    }
}

impl ProviderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Root directory for the file backend
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(".context-engine")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_storage_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compression.keep_recent_count, 5);
        assert_eq!(config.compression.emergency_keep_recent, 2);
        assert_eq!(config.budget.provider_limit_fraction, 0.85);
        assert_eq!(config.budget.compression_threshold_fraction, 0.75);
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = Config::from_toml_str(
            r#"
            [compression]
            keep_recent_count = 3
            emergency_keep_recent = 1

            [aging]
            compact_age = 3
            merge_age = 5

            [snapshots]
            max_count = 10

            [provider]
            model = "qwen2.5"
            api_key = "secret-token"
            tokenizer = "words"

            [budget.tier_overrides.tier_3_standard]
            prompt_budget = 800
            safety_margin = 900
            "#,
        )
        .unwrap();

        assert_eq!(config.compression.keep_recent_count, 3);
        assert_eq!(config.compression.min_messages, 2);
        assert_eq!(config.aging.compact_age, 3);
        assert_eq!(config.snapshots.max_count, 10);
        assert_eq!(config.provider.model, "qwen2.5");
        assert_eq!(config.provider.tokenizer, TokenizerKind::Words);
        assert_eq!(
            config.provider.api_key.as_ref().unwrap().expose_secret(),
            "secret-token"
        );

        let override_budget = config
            .budget
            .override_for(ContextTier::Tier3Standard)
            .unwrap();
        assert_eq!(override_budget.prompt_budget, 800);
        assert_eq!(override_budget.safety_margin, 900);
    }

    #[test]
    fn test_rejects_descending_emergency_fractions() {
        let mut config = Config::default();
        config.emergency.compression_fraction = 0.99;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_emergency_keep_above_normal_keep() {
        let mut config = Config::default();
        config.compression.emergency_keep_recent = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unordered_aging() {
        let mut config = Config::default();
        config.aging.merge_age = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_tier_override() {
        let mut config = Config::default();
        config.budget.tier_overrides.insert(
            "tier_9_galactic".to_string(),
            TierBudget {
                prompt_budget: 1,
                safety_margin: 1,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_fraction() {
        let mut config = Config::default();
        config.budget.provider_limit_fraction = 1.5;
        assert!(config.validate().is_err());
    }
}
