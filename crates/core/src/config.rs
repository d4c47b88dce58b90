//! Engine tuning, loaded once at start-up and injected into each component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::pattern::Frequency;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse engine config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid engine config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scoring: ScoringConfig,
    pub thresholds: MatchThresholds,
    pub recurring: RecurringConfig,
    pub rules: RuleConfig,
    pub confidence: ConfidenceConfig,
}

impl EngineConfig {
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(toml_content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scoring;
        let weights = [s.amount_weight, s.description_weight, s.date_weight];
        if weights.iter().any(|w| *w < 0.0) {
            return Err(ConfigError::Invalid("score weights must be non-negative".into()));
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "score weights must sum to 1.0, got {total}"
            )));
        }
        if s.date_tolerance_days < 0 {
            return Err(ConfigError::Invalid("date tolerance must be non-negative".into()));
        }
        if s.near_amount_tolerance >= s.amount_ceiling {
            return Err(ConfigError::Invalid(
                "near-amount tolerance must be below the amount ceiling".into(),
            ));
        }
        if s.description_saturation <= 0.0 || s.description_saturation > 1.0 {
            return Err(ConfigError::Invalid(
                "description saturation must be in (0, 1]".into(),
            ));
        }

        let t = &self.thresholds;
        if t.review > t.auto_merge || t.auto_merge > 100 {
            return Err(ConfigError::Invalid(format!(
                "thresholds must satisfy review <= auto_merge <= 100, got {}/{}",
                t.review, t.auto_merge
            )));
        }

        let r = &self.recurring;
        if r.confidence_cap > 0.99 || r.initial_confidence_cap > r.confidence_cap {
            return Err(ConfigError::Invalid(
                "recurring confidence caps must not exceed 0.99".into(),
            ));
        }
        if let Some(band) = r.bands.iter().find(|b| b.min_days > b.max_days) {
            return Err(ConfigError::Invalid(format!(
                "frequency band for {} is empty",
                band.frequency
            )));
        }

        if self.rules.promotion_threshold == 0 {
            return Err(ConfigError::Invalid("promotion threshold must be at least 1".into()));
        }
        if self.confidence.ceiling > 0.99 {
            return Err(ConfigError::Invalid("confidence ceiling must not exceed 0.99".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Pairs further apart than this are never scored.
    pub date_tolerance_days: i64,
    pub amount_weight: f64,
    pub description_weight: f64,
    pub date_weight: f64,
    /// Relative amount difference still treated as "almost exact".
    pub near_amount_tolerance: f64,
    pub near_amount_score: f64,
    /// Relative amount difference at which the amount sub-score reaches zero.
    pub amount_ceiling: f64,
    /// Token-overlap ratio that earns full description credit.
    pub description_saturation: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            date_tolerance_days: 3,
            amount_weight: 0.45,
            description_weight: 0.35,
            date_weight: 0.20,
            near_amount_tolerance: 0.01,
            near_amount_score: 0.9,
            amount_ceiling: 0.15,
            description_saturation: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchThresholds {
    pub auto_merge: u8,
    pub review: u8,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            auto_merge: 90,
            review: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub frequency: Frequency,
    pub min_days: f64,
    pub max_days: f64,
}

impl FrequencyBand {
    pub fn contains(&self, days: f64) -> bool {
        days >= self.min_days && days <= self.max_days
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurringConfig {
    /// Max relative distance from the running average for a continuation.
    pub amount_tolerance: f64,
    pub confidence_step: f32,
    pub confidence_cap: f32,
    pub lookback_days: u32,
    pub min_prior_observations: usize,
    pub initial_confidence_per_observation: f32,
    pub initial_confidence_cap: f32,
    /// Attempts at a conditional pattern update before giving up.
    pub max_update_attempts: u32,
    pub bands: Vec<FrequencyBand>,
}

impl Default for RecurringConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: 0.10,
            confidence_step: 0.05,
            confidence_cap: 0.99,
            lookback_days: 800,
            min_prior_observations: 2,
            initial_confidence_per_observation: 0.2,
            initial_confidence_cap: 0.9,
            max_update_attempts: 3,
            bands: vec![
                FrequencyBand { frequency: Frequency::Weekly, min_days: 6.0, max_days: 8.0 },
                FrequencyBand { frequency: Frequency::Monthly, min_days: 25.0, max_days: 35.0 },
                FrequencyBand { frequency: Frequency::Quarterly, min_days: 85.0, max_days: 95.0 },
                FrequencyBand { frequency: Frequency::Annually, min_days: 355.0, max_days: 375.0 },
            ],
        }
    }
}

/// Order among pattern rules that share a priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTieBreak {
    #[default]
    EarliestCreated,
    LatestCreated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub tie_break: RuleTieBreak,
    pub learned_rule_priority: i32,
    /// Same-type corrections for one merchant needed to synthesize a rule.
    pub promotion_threshold: usize,
    pub max_pattern_len: usize,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            tie_break: RuleTieBreak::EarliestCreated,
            learned_rule_priority: super::rule::DEFAULT_RULE_PRIORITY,
            promotion_threshold: 2,
            max_pattern_len: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub rule_boost: f32,
    pub history_boost: f32,
    /// Historical confidence must exceed this for the history boost.
    pub history_min_confidence: f32,
    pub recurring_boost: f32,
    pub ceiling: f32,
    /// Categorized past transactions needed before history counts as a pattern.
    pub history_min_records: usize,
    pub history_lookback_days: u32,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            rule_boost: 0.15,
            history_boost: 0.10,
            history_min_confidence: 0.7,
            recurring_boost: 0.05,
            ceiling: 0.99,
            history_min_records: 2,
            history_lookback_days: 365,
        }
    }
}
