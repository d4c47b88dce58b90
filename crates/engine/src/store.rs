//! Record stores the engine reads from and writes to.
//!
//! Every mutation that can race (rule counters, pattern running averages,
//! committed records and the staged rows behind them) is expressed as a
//! single conditional operation so implementations can make it atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::{
    CommittedTransaction, CorrectionType, DateRange, MerchantRule, NewMerchantRule,
    NewRecurringPattern, NewTransaction, NewUserCorrection, RecurringPattern, SessionKey, Source,
    StagedTransaction, UserCorrection,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Corrupt {table} record {id}: {detail}")]
    Corrupt {
        table: &'static str,
        id: i64,
        detail: String,
    },
}

impl StoreError {
    pub fn backend(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(e))
    }
}

/// Result of an insert guarded by a unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// A record with the same unique key already exists.
    Existing(i64),
}

impl InsertOutcome {
    pub fn id(self) -> i64 {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Existing(id) => id,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn session_exists(&self, session: &SessionKey) -> Result<bool, StoreError>;

    /// Staged rows of one source, in ingestion order.
    async fn staged_transactions(
        &self,
        session: &SessionKey,
        source: Source,
    ) -> Result<Vec<StagedTransaction>, StoreError>;

    /// Removes the session and its staged rows. Returns the rows removed.
    async fn clear_session(&self, session: &SessionKey) -> Result<u64, StoreError>;

    /// Inserts `tx` and marks `staged_ids` as committed to it in one atomic
    /// step. When one of the rows is already committed, or the provenance
    /// key is taken, nothing is inserted: the unmarked rows are attached to
    /// that record, which is returned as [`InsertOutcome::Existing`].
    async fn commit_staged(
        &self,
        session: &SessionKey,
        staged_ids: &[i64],
        tx: &NewTransaction,
    ) -> Result<InsertOutcome, StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_by_provenance(
        &self,
        user_id: i64,
        provenance_key: &str,
    ) -> Result<Option<i64>, StoreError>;

    /// Inserts unless the provenance key is already present.
    async fn insert_transaction(&self, tx: &NewTransaction) -> Result<InsertOutcome, StoreError>;

    /// Committed transactions whose merchant key matches `merchant_key`
    /// (see [`tally_core::keys_match`]) within `range`, oldest first.
    async fn merchant_history(
        &self,
        user_id: i64,
        merchant_key: &str,
        range: DateRange,
    ) -> Result<Vec<CommittedTransaction>, StoreError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn rules_for_user(&self, user_id: i64) -> Result<Vec<MerchantRule>, StoreError>;

    /// Earliest rule whose merchant key equals `merchant_key`.
    async fn find_rule(
        &self,
        user_id: i64,
        merchant_key: &str,
    ) -> Result<Option<MerchantRule>, StoreError>;

    /// Inserts unless the user already has a rule with the same
    /// [`tally_core::rule_name_key`].
    async fn insert_rule(&self, rule: &NewMerchantRule) -> Result<InsertOutcome, StoreError>;

    /// Atomically bumps `applied_count` and stamps `last_applied`.
    async fn record_rule_applied(&self, rule_id: i64, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn set_rule_pattern(
        &self,
        rule_id: i64,
        pattern: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn set_rule_priority(&self, rule_id: i64, priority: i32) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Best match for `merchant_key`: an equal key first, otherwise the
    /// longest key that matches as a whole-word prefix either way.
    async fn find_pattern(
        &self,
        user_id: i64,
        merchant_key: &str,
    ) -> Result<Option<RecurringPattern>, StoreError>;

    async fn insert_pattern(
        &self,
        pattern: &NewRecurringPattern,
    ) -> Result<InsertOutcome, StoreError>;

    /// Writes `pattern` only if the stored row still has
    /// `detected_from == expected_detected_from`. Returns whether it applied.
    async fn update_pattern(
        &self,
        pattern: &RecurringPattern,
        expected_detected_from: u32,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CorrectionLog: Send + Sync {
    async fn append_correction(&self, correction: &NewUserCorrection) -> Result<i64, StoreError>;

    async fn corrections_for_merchant(
        &self,
        user_id: i64,
        correction_type: CorrectionType,
        merchant_key: &str,
    ) -> Result<Vec<UserCorrection>, StoreError>;

    async fn mark_applied_as_rule(&self, correction_ids: &[i64]) -> Result<(), StoreError>;
}
