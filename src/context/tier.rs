//! Tier policy: context window size to budget numbers
//!
//! A session's tier is derived from the model's advertised context window
//! and fixes the prompt budget and safety margin reserved out of the
//! provider limit. The compression threshold is what remains for the
//! conversation after those reservations, scaled by a tier-independent
//! fraction:
//!
//! ```text
//! available = limit - system_prompt - prompt_budget - safety_margin
//! threshold = available * compression_threshold_fraction
//! ```

use crate::config::BudgetConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Budget tier derived from the model's context window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContextTier {
    #[serde(rename = "tier_1_minimal")]
    Tier1Minimal,
    #[serde(rename = "tier_2_basic")]
    Tier2Basic,
    #[serde(rename = "tier_3_standard")]
    Tier3Standard,
    #[serde(rename = "tier_4_premium")]
    Tier4Premium,
    #[serde(rename = "tier_5_ultra")]
    Tier5Ultra,
}

impl ContextTier {
    pub const ALL: [ContextTier; 5] = [
        ContextTier::Tier1Minimal,
        ContextTier::Tier2Basic,
        ContextTier::Tier3Standard,
        ContextTier::Tier4Premium,
        ContextTier::Tier5Ultra,
    ];

    /// Classify a context window size
    pub fn from_window(window_size: usize) -> Self {
        match window_size {
            0..=4095 => Self::Tier1Minimal,
            4096..=8191 => Self::Tier2Basic,
            8192..=32767 => Self::Tier3Standard,
            32768..=65535 => Self::Tier4Premium,
            _ => Self::Tier5Ultra,
        }
    }

    /// Built-in budget numbers for this tier
    pub fn default_budget(&self) -> TierBudget {
        let (prompt_budget, safety_margin) = match self {
            Self::Tier1Minimal => (200, 500),
            Self::Tier2Basic => (500, 750),
            Self::Tier3Standard => (1000, 1000),
            Self::Tier4Premium => (1500, 1500),
            Self::Tier5Ultra => (1500, 2000),
        };
        TierBudget {
            prompt_budget,
            safety_margin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tier1Minimal => "tier_1_minimal",
            Self::Tier2Basic => "tier_2_basic",
            Self::Tier3Standard => "tier_3_standard",
            Self::Tier4Premium => "tier_4_premium",
            Self::Tier5Ultra => "tier_5_ultra",
        }
    }
}

impl fmt::Display for ContextTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextTier {
    type Err = BudgetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| BudgetError::UnknownTier(s.to_string()))
    }
}

/// Tokens reserved per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudget {
    /// Reserved for the per-turn prompt (tool schemas, instructions)
    pub prompt_budget: usize,
    /// Reserved for the model's completion and estimation error
    pub safety_margin: usize,
}

/// Budget numbers resolved for one session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub tier: ContextTier,
    pub window_size: usize,
    /// Effective hard limit (window reduced by the provider fraction)
    pub provider_limit: usize,
    pub prompt_budget: usize,
    pub safety_margin: usize,
    pub compression_threshold_fraction: f64,
}

impl ContextBudget {
    /// Tokens left for checkpoints and recent messages
    pub fn available(&self, system_prompt_tokens: usize) -> Result<usize, BudgetError> {
        let reserved = system_prompt_tokens + self.prompt_budget + self.safety_margin;
        self.provider_limit
            .checked_sub(reserved)
            .ok_or(BudgetError::InsufficientBudget {
                needed: reserved,
                available: self.provider_limit,
            })
    }

    /// Conversation size at which a compression pass is due
    pub fn compression_threshold(&self, system_prompt_tokens: usize) -> Result<usize, BudgetError> {
        let available = self.available(system_prompt_tokens)?;
        Ok((available as f64 * self.compression_threshold_fraction).floor() as usize)
    }

    /// Fraction of the provider limit consumed by `tokens`
    pub fn usage_fraction(&self, tokens: usize) -> f64 {
        if self.provider_limit == 0 {
            return 1.0;
        }
        tokens as f64 / self.provider_limit as f64
    }
}

/// Token budget errors
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Budget exceeded: {used} tokens used, {max} tokens allowed")]
    BudgetExceeded { used: usize, max: usize },

    #[error("Insufficient budget: need {needed} tokens, have {available} tokens")]
    InsufficientBudget { needed: usize, available: usize },

    #[error("Unknown context tier: {0}")]
    UnknownTier(String),
}

/// Maps window sizes to budgets, applying configured overrides
#[derive(Debug, Clone)]
pub struct TierPolicy {
    config: BudgetConfig,
}

impl TierPolicy {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    /// Resolve the budget for a model's advertised context window
    pub fn resolve(&self, window_size: usize) -> ContextBudget {
        let tier = ContextTier::from_window(window_size);
        let budget = self
            .config
            .override_for(tier)
            .copied()
            .unwrap_or_else(|| tier.default_budget());

        ContextBudget {
            tier,
            window_size,
            provider_limit: self.provider_limit(window_size),
            prompt_budget: budget.prompt_budget,
            safety_margin: budget.safety_margin,
            compression_threshold_fraction: self.config.compression_threshold_fraction,
        }
    }

    /// Effective limit after reducing the nominal window
    pub fn provider_limit(&self, window_size: usize) -> usize {
        (window_size as f64 * self.config.provider_limit_fraction).floor() as usize
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_from_window() {
        assert_eq!(ContextTier::from_window(2048), ContextTier::Tier1Minimal);
        assert_eq!(ContextTier::from_window(4096), ContextTier::Tier2Basic);
        assert_eq!(ContextTier::from_window(8192), ContextTier::Tier3Standard);
        assert_eq!(ContextTier::from_window(32768), ContextTier::Tier4Premium);
        assert_eq!(ContextTier::from_window(131072), ContextTier::Tier5Ultra);
    }

    #[test]
    fn test_worked_example_threshold() {
        let policy = TierPolicy::default();
        let budget = policy.resolve(8192);

        assert_eq!(budget.tier, ContextTier::Tier3Standard);
        assert_eq!(budget.provider_limit, 6963);
        assert_eq!(budget.prompt_budget, 1000);
        assert_eq!(budget.safety_margin, 1000);
        assert_eq!(budget.available(500).unwrap(), 4463);
        assert_eq!(budget.compression_threshold(500).unwrap(), 3347);
    }

    #[test]
    fn test_insufficient_budget() {
        let budget = TierPolicy::default().resolve(2048);
        let result = budget.compression_threshold(5000);
        assert!(matches!(result, Err(BudgetError::InsufficientBudget { .. })));
    }

    #[test]
    fn test_override_applies_to_tier() {
        let mut config = BudgetConfig::default();
        config.tier_overrides.insert(
            "tier_3_standard".to_string(),
            TierBudget {
                prompt_budget: 500,
                safety_margin: 500,
            },
        );
        let policy = TierPolicy::new(config);

        let budget = policy.resolve(8192);
        assert_eq!(budget.prompt_budget, 500);
        assert_eq!(budget.compression_threshold(500).unwrap(), 4097);

        // Other tiers keep their built-in numbers
        let other = policy.resolve(65536);
        assert_eq!(other.prompt_budget, 1500);
    }

    #[test]
    fn test_tier_round_trips_through_name() {
        for tier in ContextTier::ALL {
            assert_eq!(tier.as_str().parse::<ContextTier>().unwrap(), tier);
        }
        assert!("tier_0".parse::<ContextTier>().is_err());
    }

    #[test]
    fn test_usage_fraction() {
        let budget = TierPolicy::default().resolve(8192);
        assert!((budget.usage_fraction(6963) - 1.0).abs() < f64::EPSILON);
        assert!(budget.usage_fraction(3481) < 0.5);
    }
}
