use serde::{Deserialize, Serialize};
use tally_core::ConfidenceConfig;

/// Evidence gathered about one transaction's classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSignals {
    pub base: f32,
    pub has_historical_pattern: bool,
    pub historical_confidence: f32,
    pub has_merchant_rule: bool,
    pub has_recurring_pattern: bool,
}

/// Base confidence plus additive boosts, never above the ceiling.
pub fn enhanced_confidence(config: &ConfidenceConfig, signals: &ConfidenceSignals) -> f32 {
    let mut score = signals.base.max(0.0);
    if signals.has_merchant_rule {
        score += config.rule_boost;
    }
    if signals.has_historical_pattern && signals.historical_confidence > config.history_min_confidence {
        score += config.history_boost;
    }
    if signals.has_recurring_pattern {
        score += config.recurring_boost;
    }
    score.min(config.ceiling)
}
