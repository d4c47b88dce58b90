//! SQLite implementation of the engine's record stores.
//!
//! Races are settled by the database: unique keys guard inserts
//! (`ON CONFLICT DO NOTHING`), rule counters increment in place, and
//! pattern updates are conditional on the previously read `detected_from`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqliteConnection;
use tally_core::{
    CommittedTransaction, CorrectionType, DateRange, Frequency, MerchantRule, Money,
    NewMerchantRule, NewRecurringPattern, NewStagedTransaction, NewTransaction, NewUserCorrection,
    RecurringPattern, SessionKey, Source, StagedTransaction, UserCorrection,
};
use tally_engine::{
    CorrectionLog, InsertOutcome, LedgerStore, PatternStore, RuleStore, StagingStore, StoreError,
};

use crate::db::DbPool;

/// Matches keys equal to `?` or related to it as a whole-word prefix
/// either way. Keys hold only lowercase letters and single spaces, so
/// they never contain LIKE wildcards.
const KEY_MATCH: &str =
    "(merchant_key = ?1 OR merchant_key LIKE ?1 || ' %' OR ?1 LIKE merchant_key || ' %')";

type StagedRow = (
    i64,
    i64,
    String,
    String,
    Option<NaiveDate>,
    Option<i64>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    f32,
    Option<i64>,
);

type TransactionRow = (
    i64,
    i64,
    NaiveDate,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    f32,
    bool,
    String,
    Option<DateTime<Utc>>,
);

type RuleRow = (
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    i32,
    i64,
    Option<DateTime<Utc>>,
    bool,
    DateTime<Utc>,
);

type PatternRow = (
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    i64,
    String,
    u32,
    NaiveDate,
    NaiveDate,
    f32,
);

type CorrectionRow = (
    i64,
    i64,
    Option<i64>,
    String,
    Option<String>,
    String,
    Option<String>,
    bool,
    DateTime<Utc>,
);

const STAGED_COLUMNS: &str = "id, user_id, session_id, source, date, amount_cents, description, merchant, category, profile_type, notes, confidence, committed_as";
const TRANSACTION_COLUMNS: &str = "id, user_id, date, amount_cents, description, merchant, category, profile_type, notes, confidence, is_recurring, provenance_key, created_at";
const RULE_COLUMNS: &str = "id, user_id, merchant_name, merchant_pattern, suggested_category, profile_type, priority, applied_count, last_applied, auto_apply, created_at";
const PATTERN_COLUMNS: &str = "id, user_id, merchant_name, category, profile_type, average_amount_cents, frequency, detected_from, last_occurrence, next_expected, confidence";
const CORRECTION_COLUMNS: &str = "id, user_id, transaction_id, correction_type, original_value, corrected_value, merchant_name, applied_as_rule, created_at";

fn corrupt(table: &'static str, id: i64, detail: String) -> StoreError {
    StoreError::Corrupt { table, id, detail }
}

fn staged_from_row(r: StagedRow) -> Result<StagedTransaction, StoreError> {
    let source = r
        .3
        .parse::<Source>()
        .map_err(|e| corrupt("staged_transactions", r.0, e))?;
    Ok(StagedTransaction {
        id: r.0,
        session: SessionKey::new(r.1, r.2),
        source,
        date: r.4,
        amount: r.5.map(Money::from_cents),
        description: r.6,
        merchant: r.7,
        category: r.8,
        profile_type: r.9,
        notes: r.10,
        confidence: r.11,
        committed_as: r.12,
    })
}

fn transaction_from_row(r: TransactionRow) -> CommittedTransaction {
    CommittedTransaction {
        id: r.0,
        user_id: r.1,
        date: r.2,
        amount: Money::from_cents(r.3),
        description: r.4,
        merchant: r.5,
        category: r.6,
        profile_type: r.7,
        notes: r.8,
        confidence: r.9,
        is_recurring: r.10,
        provenance_key: r.11,
        created_at: r.12,
    }
}

fn rule_from_row(r: RuleRow) -> MerchantRule {
    MerchantRule {
        id: r.0,
        user_id: r.1,
        merchant_name: r.2,
        merchant_pattern: r.3,
        suggested_category: r.4,
        profile_type: r.5,
        priority: r.6,
        applied_count: r.7,
        last_applied: r.8,
        auto_apply: r.9,
        created_at: r.10,
    }
}

fn pattern_from_row(r: PatternRow) -> Result<RecurringPattern, StoreError> {
    let frequency = r
        .6
        .parse::<Frequency>()
        .map_err(|e| corrupt("recurring_patterns", r.0, e))?;
    Ok(RecurringPattern {
        id: r.0,
        user_id: r.1,
        merchant_name: r.2,
        category: r.3,
        profile_type: r.4,
        average_amount: Money::from_cents(r.5),
        frequency,
        detected_from: r.7,
        last_occurrence: r.8,
        next_expected: r.9,
        confidence: r.10,
    })
}

fn correction_from_row(r: CorrectionRow) -> Result<UserCorrection, StoreError> {
    let correction_type = r
        .3
        .parse::<CorrectionType>()
        .map_err(|e| corrupt("user_corrections", r.0, e))?;
    Ok(UserCorrection {
        id: r.0,
        user_id: r.1,
        transaction_id: r.2,
        correction_type,
        original_value: r.4,
        corrected_value: r.5,
        merchant_name: r.6,
        applied_as_rule: r.7,
        created_at: r.8,
    })
}

async fn insert_ledger(
    conn: &mut SqliteConnection,
    tx: &NewTransaction,
) -> Result<InsertOutcome, sqlx::Error> {
    let inserted: Option<i64> = sqlx::query_scalar(
        "INSERT INTO transactions (user_id, date, amount_cents, description, merchant, merchant_key, category, profile_type, notes, confidence, is_recurring, provenance_key, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (provenance_key) DO NOTHING RETURNING id",
    )
    .bind(tx.user_id)
    .bind(tx.date)
    .bind(tx.amount.to_cents())
    .bind(&tx.description)
    .bind(&tx.merchant)
    .bind(tx.merchant_key().unwrap_or_default())
    .bind(&tx.category)
    .bind(&tx.profile_type)
    .bind(&tx.notes)
    .bind(tx.confidence)
    .bind(tx.is_recurring)
    .bind(&tx.provenance_key)
    .bind(Utc::now())
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(id) => Ok(InsertOutcome::Inserted(id)),
        None => {
            let id: i64 = sqlx::query_scalar("SELECT id FROM transactions WHERE provenance_key = ?")
                .bind(&tx.provenance_key)
                .fetch_one(&mut *conn)
                .await?;
            Ok(InsertOutcome::Existing(id))
        }
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        SqliteStore { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Opens `session` if needed and appends `records` in one transaction.
    /// Returns the staged ids in input order.
    pub async fn stage(
        &self,
        session: &SessionKey,
        records: &[NewStagedTransaction],
    ) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        sqlx::query(
            "INSERT INTO reconciliation_sessions (user_id, session_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(session.user_id)
        .bind(&session.session_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO staged_transactions (user_id, session_id, source, date, amount_cents, description, merchant, category, profile_type, notes, confidence)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(session.user_id)
            .bind(&session.session_id)
            .bind(record.source.to_string())
            .bind(record.date)
            .bind(record.amount.map(Money::to_cents))
            .bind(&record.description)
            .bind(&record.merchant)
            .bind(&record.category)
            .bind(&record.profile_type)
            .bind(&record.notes)
            .bind(record.confidence)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
            ids.push(id);
        }

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(ids)
    }

    /// Every committed transaction for `user_id`, oldest first.
    pub async fn transactions(&self, user_id: i64) -> Result<Vec<CommittedTransaction>, StoreError> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE user_id = ? ORDER BY date, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(rows.into_iter().map(transaction_from_row).collect())
    }
}

#[async_trait]
impl StagingStore for SqliteStore {
    async fn session_exists(&self, session: &SessionKey) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM reconciliation_sessions WHERE user_id = ? AND session_id = ?",
        )
        .bind(session.user_id)
        .bind(&session.session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(found.is_some())
    }

    async fn staged_transactions(
        &self,
        session: &SessionKey,
        source: Source,
    ) -> Result<Vec<StagedTransaction>, StoreError> {
        let rows = sqlx::query_as::<_, StagedRow>(&format!(
            "SELECT {STAGED_COLUMNS} FROM staged_transactions WHERE user_id = ? AND session_id = ? AND source = ? ORDER BY id"
        ))
        .bind(session.user_id)
        .bind(&session.session_id)
        .bind(source.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        rows.into_iter().map(staged_from_row).collect()
    }

    async fn clear_session(&self, session: &SessionKey) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;
        let removed = sqlx::query("DELETE FROM staged_transactions WHERE user_id = ? AND session_id = ?")
            .bind(session.user_id)
            .bind(&session.session_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?
            .rows_affected();
        sqlx::query("DELETE FROM reconciliation_sessions WHERE user_id = ? AND session_id = ?")
            .bind(session.user_id)
            .bind(&session.session_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        tx.commit().await.map_err(StoreError::backend)?;
        Ok(removed)
    }

    async fn commit_staged(
        &self,
        session: &SessionKey,
        staged_ids: &[i64],
        record: &NewTransaction,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        let mut prior = None;
        for id in staged_ids {
            let committed_as: Option<Option<i64>> = sqlx::query_scalar(
                "SELECT committed_as FROM staged_transactions WHERE id = ? AND user_id = ? AND session_id = ?",
            )
            .bind(*id)
            .bind(session.user_id)
            .bind(&session.session_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
            prior = prior.or(committed_as.flatten());
        }

        let outcome = match prior {
            Some(id) => InsertOutcome::Existing(id),
            None => insert_ledger(&mut *tx, record)
                .await
                .map_err(StoreError::backend)?,
        };

        for id in staged_ids {
            sqlx::query(
                "UPDATE staged_transactions SET committed_as = COALESCE(committed_as, ?)
                 WHERE id = ? AND user_id = ? AND session_id = ?",
            )
            .bind(outcome.id())
            .bind(*id)
            .bind(session.user_id)
            .bind(&session.session_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        }

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(outcome)
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn find_by_provenance(
        &self,
        user_id: i64,
        provenance_key: &str,
    ) -> Result<Option<i64>, StoreError> {
        sqlx::query_scalar("SELECT id FROM transactions WHERE user_id = ? AND provenance_key = ?")
            .bind(user_id)
            .bind(provenance_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)
    }

    async fn insert_transaction(&self, tx: &NewTransaction) -> Result<InsertOutcome, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(StoreError::backend)?;
        insert_ledger(&mut *conn, tx).await.map_err(StoreError::backend)
    }

    async fn merchant_history(
        &self,
        user_id: i64,
        merchant_key: &str,
        range: DateRange,
    ) -> Result<Vec<CommittedTransaction>, StoreError> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE {KEY_MATCH} AND user_id = ?2 AND date >= ?3 AND date <= ?4
             ORDER BY date, id"
        ))
        .bind(merchant_key)
        .bind(user_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(rows.into_iter().map(transaction_from_row).collect())
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn rules_for_user(&self, user_id: i64) -> Result<Vec<MerchantRule>, StoreError> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM merchant_rules WHERE user_id = ? ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(rows.into_iter().map(rule_from_row).collect())
    }

    async fn find_rule(
        &self,
        user_id: i64,
        merchant_key: &str,
    ) -> Result<Option<MerchantRule>, StoreError> {
        let row = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM merchant_rules WHERE user_id = ? AND merchant_key = ? ORDER BY id LIMIT 1"
        ))
        .bind(user_id)
        .bind(merchant_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(row.map(rule_from_row))
    }

    async fn insert_rule(&self, rule: &NewMerchantRule) -> Result<InsertOutcome, StoreError> {
        let name_key = rule.name_key();
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO merchant_rules (user_id, merchant_name, name_key, merchant_key, merchant_pattern, suggested_category, profile_type, priority, auto_apply, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, name_key) DO NOTHING RETURNING id",
        )
        .bind(rule.user_id)
        .bind(&rule.merchant_name)
        .bind(&name_key)
        .bind(rule.merchant_key().unwrap_or_default())
        .bind(&rule.merchant_pattern)
        .bind(&rule.suggested_category)
        .bind(&rule.profile_type)
        .bind(rule.priority)
        .bind(rule.auto_apply)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        match inserted {
            Some(id) => Ok(InsertOutcome::Inserted(id)),
            None => {
                let id: i64 = sqlx::query_scalar(
                    "SELECT id FROM merchant_rules WHERE user_id = ? AND name_key = ?",
                )
                .bind(rule.user_id)
                .bind(&name_key)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::backend)?;
                Ok(InsertOutcome::Existing(id))
            }
        }
    }

    async fn record_rule_applied(
        &self,
        rule_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE merchant_rules SET applied_count = applied_count + 1, last_applied = ? WHERE id = ?",
        )
        .bind(at)
        .bind(rule_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn set_rule_pattern(
        &self,
        rule_id: i64,
        pattern: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE merchant_rules SET merchant_pattern = ? WHERE id = ?")
            .bind(pattern)
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_rule_priority(&self, rule_id: i64, priority: i32) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE merchant_rules SET priority = ? WHERE id = ?")
            .bind(priority)
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl PatternStore for SqliteStore {
    async fn find_pattern(
        &self,
        user_id: i64,
        merchant_key: &str,
    ) -> Result<Option<RecurringPattern>, StoreError> {
        let row = sqlx::query_as::<_, PatternRow>(&format!(
            "SELECT {PATTERN_COLUMNS} FROM recurring_patterns
             WHERE {KEY_MATCH} AND user_id = ?2
             ORDER BY merchant_key = ?1 DESC, length(merchant_key) DESC, id
             LIMIT 1"
        ))
        .bind(merchant_key)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        row.map(pattern_from_row).transpose()
    }

    async fn insert_pattern(
        &self,
        pattern: &NewRecurringPattern,
    ) -> Result<InsertOutcome, StoreError> {
        let key = pattern.merchant_key().unwrap_or_default();
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO recurring_patterns (user_id, merchant_name, merchant_key, category, profile_type, average_amount_cents, frequency, detected_from, last_occurrence, next_expected, confidence)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, merchant_key) DO NOTHING RETURNING id",
        )
        .bind(pattern.user_id)
        .bind(&pattern.merchant_name)
        .bind(&key)
        .bind(&pattern.category)
        .bind(&pattern.profile_type)
        .bind(pattern.average_amount.to_cents())
        .bind(pattern.frequency.to_string())
        .bind(pattern.detected_from)
        .bind(pattern.last_occurrence)
        .bind(pattern.next_expected)
        .bind(pattern.confidence)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        match inserted {
            Some(id) => Ok(InsertOutcome::Inserted(id)),
            None => {
                let id: i64 = sqlx::query_scalar(
                    "SELECT id FROM recurring_patterns WHERE user_id = ? AND merchant_key = ?",
                )
                .bind(pattern.user_id)
                .bind(&key)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::backend)?;
                Ok(InsertOutcome::Existing(id))
            }
        }
    }

    async fn update_pattern(
        &self,
        pattern: &RecurringPattern,
        expected_detected_from: u32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE recurring_patterns
             SET category = ?, profile_type = ?, average_amount_cents = ?, detected_from = ?,
                 last_occurrence = ?, next_expected = ?, confidence = ?
             WHERE id = ? AND detected_from = ?",
        )
        .bind(&pattern.category)
        .bind(&pattern.profile_type)
        .bind(pattern.average_amount.to_cents())
        .bind(pattern.detected_from)
        .bind(pattern.last_occurrence)
        .bind(pattern.next_expected)
        .bind(pattern.confidence)
        .bind(pattern.id)
        .bind(expected_detected_from)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl CorrectionLog for SqliteStore {
    async fn append_correction(&self, correction: &NewUserCorrection) -> Result<i64, StoreError> {
        sqlx::query_scalar(
            "INSERT INTO user_corrections (user_id, transaction_id, correction_type, original_value, corrected_value, merchant_name, merchant_key, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(correction.user_id)
        .bind(correction.transaction_id)
        .bind(correction.correction_type.to_string())
        .bind(&correction.original_value)
        .bind(&correction.corrected_value)
        .bind(&correction.merchant_name)
        .bind(correction.merchant_key())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::backend)
    }

    async fn corrections_for_merchant(
        &self,
        user_id: i64,
        correction_type: CorrectionType,
        key: &str,
    ) -> Result<Vec<UserCorrection>, StoreError> {
        let rows = sqlx::query_as::<_, CorrectionRow>(&format!(
            "SELECT {CORRECTION_COLUMNS} FROM user_corrections
             WHERE {KEY_MATCH} AND user_id = ?2 AND correction_type = ?3
             ORDER BY id"
        ))
        .bind(key)
        .bind(user_id)
        .bind(correction_type.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        rows.into_iter().map(correction_from_row).collect()
    }

    async fn mark_applied_as_rule(&self, correction_ids: &[i64]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;
        for id in correction_ids {
            sqlx::query("UPDATE user_corrections SET applied_as_rule = 1 WHERE id = ?")
                .bind(*id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        }
        tx.commit().await.map_err(StoreError::backend)?;
        Ok(())
    }
}
