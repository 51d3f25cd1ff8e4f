//! Emergency ladder
//!
//! Classifies usage (fraction of the provider limit) into rungs. Each rung
//! above `Normal` asks for a stronger response: warn, compress, compress
//! with fewer kept messages and no retry, and finally roll over.

use crate::config::EmergencyConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Usage rung, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLevel {
    Normal,
    Warning,
    Compress,
    Emergency,
    Overflow,
}

impl UsageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Compress => "compress",
            Self::Emergency => "emergency",
            Self::Overflow => "overflow",
        }
    }
}

impl fmt::Display for UsageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response taken for one message or emergency call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyAction {
    None,
    Warned,
    Compressed,
    EmergencyCompressed,
    Rollover,
}

impl EmergencyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Warned => "warned",
            Self::Compressed => "compressed",
            Self::EmergencyCompressed => "emergency_compressed",
            Self::Rollover => "rollover",
        }
    }
}

/// Usage thresholds for the emergency rungs
#[derive(Debug, Clone)]
pub struct EmergencyLadder {
    config: EmergencyConfig,
}

impl EmergencyLadder {
    pub fn new(config: EmergencyConfig) -> Self {
        Self { config }
    }

    /// Rung for a usage fraction
    pub fn classify(&self, usage: f64) -> UsageLevel {
        if usage >= 1.0 {
            UsageLevel::Overflow
        } else if usage >= self.config.emergency_fraction {
            UsageLevel::Emergency
        } else if usage >= self.config.compression_fraction {
            UsageLevel::Compress
        } else if usage >= self.config.warning_fraction {
            UsageLevel::Warning
        } else {
            UsageLevel::Normal
        }
    }

    /// Messages kept by a rollover
    pub fn rollover_keep(&self) -> usize {
        self.config.rollover_keep_recent
    }

    pub fn config(&self) -> &EmergencyConfig {
        &self.config
    }
}

impl Default for EmergencyLadder {
    fn default() -> Self {
        Self::new(EmergencyConfig::default())
    }
}
