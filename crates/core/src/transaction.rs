use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::merchant::merchant_key;
use super::money::Money;

/// Where a staged transaction was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Document,
    Manual,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Document => write!(f, "DOCUMENT"),
            Source::Manual => write!(f, "MANUAL"),
        }
    }
}

impl std::str::FromStr for Source {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DOCUMENT" => Ok(Source::Document),
            "MANUAL" => Ok(Source::Manual),
            other => Err(format!("Unknown transaction source: '{other}'")),
        }
    }
}

/// A reconciliation session is owned by exactly one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: i64,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: i64, session_id: impl Into<String>) -> Self {
        SessionKey {
            user_id,
            session_id: session_id.into(),
        }
    }

    pub fn generate(user_id: i64) -> Self {
        SessionKey::new(user_id, uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.session_id)
    }
}

/// A staged row as ingested, before validation. Date and amount may be
/// missing when the extraction step could not read them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStagedTransaction {
    pub source: Source,
    pub date: Option<NaiveDate>,
    pub amount: Option<Money>,
    pub description: String,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub profile_type: Option<String>,
    pub notes: Option<String>,
    pub confidence: f32,
}

impl NewStagedTransaction {
    pub fn new(source: Source, date: NaiveDate, amount: Money, description: &str) -> Self {
        NewStagedTransaction {
            source,
            date: Some(date),
            amount: Some(amount),
            description: description.to_string(),
            merchant: None,
            category: None,
            profile_type: None,
            notes: None,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedTransaction {
    pub id: i64,
    pub session: SessionKey,
    pub source: Source,
    pub date: Option<NaiveDate>,
    pub amount: Option<Money>,
    pub description: String,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub profile_type: Option<String>,
    pub notes: Option<String>,
    pub confidence: f32,
    /// Ledger record this row went into, once committed.
    pub committed_as: Option<i64>,
}

impl StagedTransaction {
    pub fn from_new(id: i64, session: SessionKey, tx: NewStagedTransaction) -> Self {
        StagedTransaction {
            id,
            session,
            source: tx.source,
            date: tx.date,
            amount: tx.amount,
            description: tx.description,
            merchant: tx.merchant,
            category: tx.category,
            profile_type: tx.profile_type,
            notes: tx.notes,
            confidence: tx.confidence,
            committed_as: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Staged transaction {0} has no date")]
    MissingDate(i64),
    #[error("Staged transaction {0} has no amount")]
    MissingAmount(i64),
}

impl ValidationError {
    pub fn staged_id(&self) -> i64 {
        match self {
            ValidationError::MissingDate(id) | ValidationError::MissingAmount(id) => *id,
        }
    }
}

/// A staged transaction that carries every field the matcher needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchableTransaction {
    pub id: i64,
    pub source: Source,
    pub date: NaiveDate,
    pub amount: Money,
    pub description: String,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub profile_type: Option<String>,
    pub notes: Option<String>,
    pub confidence: f32,
}

impl MatchableTransaction {
    pub fn validate(tx: StagedTransaction) -> Result<MatchableTransaction, ValidationError> {
        let date = tx.date.ok_or(ValidationError::MissingDate(tx.id))?;
        let amount = tx.amount.ok_or(ValidationError::MissingAmount(tx.id))?;

        Ok(MatchableTransaction {
            id: tx.id,
            source: tx.source,
            date,
            amount,
            description: tx.description,
            merchant: tx.merchant,
            category: tx.category,
            profile_type: tx.profile_type,
            notes: tx.notes,
            confidence: tx.confidence,
        })
    }
}

/// A final record about to be written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub user_id: i64,
    pub date: NaiveDate,
    pub amount: Money,
    pub description: String,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub profile_type: Option<String>,
    pub notes: Option<String>,
    pub confidence: f32,
    pub is_recurring: bool,
    /// Session + constituent staged ids; unique across the ledger.
    pub provenance_key: String,
}

impl NewTransaction {
    /// Name used for merchant lookups: the merchant when known, otherwise
    /// the description.
    pub fn counterparty(&self) -> &str {
        self.merchant.as_deref().unwrap_or(&self.description)
    }

    pub fn merchant_key(&self) -> Option<String> {
        merchant_key(self.counterparty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedTransaction {
    pub id: i64,
    pub user_id: i64,
    pub date: NaiveDate,
    pub amount: Money,
    pub description: String,
    pub merchant: Option<String>,
    pub category: Option<String>,
    pub profile_type: Option<String>,
    pub notes: Option<String>,
    pub confidence: f32,
    pub is_recurring: bool,
    pub provenance_key: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl CommittedTransaction {
    pub fn from_new(id: i64, tx: NewTransaction, created_at: Option<DateTime<Utc>>) -> Self {
        CommittedTransaction {
            id,
            user_id: tx.user_id,
            date: tx.date,
            amount: tx.amount,
            description: tx.description,
            merchant: tx.merchant,
            category: tx.category,
            profile_type: tx.profile_type,
            notes: tx.notes,
            confidence: tx.confidence,
            is_recurring: tx.is_recurring,
            provenance_key: tx.provenance_key,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn staged(date: Option<NaiveDate>, amount: Option<Money>) -> StagedTransaction {
        StagedTransaction {
            id: 42,
            session: SessionKey::new(1, "s"),
            source: Source::Document,
            date,
            amount,
            description: "STARBUCKS #123".to_string(),
            merchant: None,
            category: None,
            profile_type: None,
            notes: None,
            confidence: 0.8,
            committed_as: None,
        }
    }

    #[test]
    fn validate_complete_record() {
        let tx = MatchableTransaction::validate(staged(
            Some(date(2024, 11, 1)),
            Some(Money::from_cents(5000)),
        ))
        .unwrap();
        assert_eq!(tx.id, 42);
        assert_eq!(tx.amount.to_cents(), 5000);
    }

    #[test]
    fn validate_rejects_missing_date() {
        let err = MatchableTransaction::validate(staged(None, Some(Money::from_cents(1))))
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingDate(42));
        assert_eq!(err.staged_id(), 42);
    }

    #[test]
    fn validate_rejects_missing_amount() {
        let err = MatchableTransaction::validate(staged(Some(date(2024, 1, 1)), None))
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingAmount(42));
    }

    #[test]
    fn source_roundtrip() {
        assert_eq!(Source::from_str("document").unwrap(), Source::Document);
        assert_eq!(Source::from_str(&Source::Manual.to_string()).unwrap(), Source::Manual);
        assert!(Source::from_str("fax").is_err());
    }

    #[test]
    fn source_serializes_upper_snake() {
        assert_eq!(serde_json::to_string(&Source::Document).unwrap(), "\"DOCUMENT\"");
    }

    #[test]
    fn generated_sessions_are_distinct() {
        let a = SessionKey::generate(1);
        let b = SessionKey::generate(1);
        assert_ne!(a, b);
        assert_eq!(a.user_id, 1);
    }

    #[test]
    fn counterparty_falls_back_to_description() {
        let mut tx = NewTransaction {
            user_id: 1,
            date: date(2024, 1, 1),
            amount: Money::from_cents(100),
            description: "NETFLIX.COM 866".to_string(),
            merchant: None,
            category: None,
            profile_type: None,
            notes: None,
            confidence: 0.5,
            is_recurring: false,
            provenance_key: "k".to_string(),
        };
        assert_eq!(tx.merchant_key().as_deref(), Some("netflix com"));
        tx.merchant = Some("Netflix".to_string());
        assert_eq!(tx.merchant_key().as_deref(), Some("netflix"));
    }
}
