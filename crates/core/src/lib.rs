pub mod config;
pub mod correction;
pub mod merchant;
pub mod money;
pub mod pattern;
pub mod period;
pub mod provenance;
pub mod rule;
pub mod transaction;

pub use config::{
    ConfidenceConfig, ConfigError, EngineConfig, FrequencyBand, MatchThresholds, RecurringConfig,
    RuleConfig, RuleTieBreak, ScoringConfig,
};
pub use correction::{CorrectionType, NewUserCorrection, UserCorrection};
pub use merchant::{keys_match, merchant_key, normalize_text};
pub use money::Money;
pub use pattern::{Frequency, NewRecurringPattern, RecurringPattern};
pub use period::{days_between, DateRange};
pub use provenance::provenance_key;
pub use rule::{rule_name_key, MerchantRule, NewMerchantRule, DEFAULT_RULE_PRIORITY};
pub use transaction::{
    CommittedTransaction, MatchableTransaction, NewStagedTransaction, NewTransaction,
    SessionKey, Source, StagedTransaction, ValidationError,
};
