pub mod confidence;
pub mod intelligence;
pub mod learner;
pub mod matcher;
pub mod memory;
pub mod reconciler;
pub mod recurring;
pub mod rules;
pub mod scorer;
pub mod store;

pub use confidence::{enhanced_confidence, ConfidenceSignals};
pub use intelligence::{dominant_category, Enrich, HistoricalCategory, MerchantInsight, MerchantIntelligence};
pub use learner::{CorrectionError, CorrectionLearner, CorrectionOutcome};
pub use matcher::{GreedyMatcher, MatchDecision, MatchOutcome, MatchPair};
pub use memory::MemoryStore;
pub use reconciler::{
    CommitItem, CommitReport, ItemOutcome, ReconcileError, ReconcileResult, ReconcileSummary,
    Reconciler, RejectedRecord, ReviewAction, ReviewDecision,
};
pub use recurring::{Observation, RecurringDetection, RecurringDetector};
pub use rules::{MerchantRuleEngine, PatternCache, RuleError, RuleMatch, RuleMatchKind};
pub use scorer::{ScoreBreakdown, SimilarityScorer};
pub use store::{
    CorrectionLog, InsertOutcome, LedgerStore, PatternStore, RuleStore, StagingStore, StoreError,
};
