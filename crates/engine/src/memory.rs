//! In-process implementation of every store trait. Suitable for embedding
//! and for tests; each operation holds the lock for its whole duration, so
//! conditional updates are atomic.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::{
    keys_match, merchant_key, CommittedTransaction, CorrectionType, DateRange, MerchantRule,
    NewMerchantRule, NewRecurringPattern, NewStagedTransaction, NewTransaction, NewUserCorrection,
    RecurringPattern, SessionKey, Source, StagedTransaction, UserCorrection,
};
use tokio::sync::Mutex;

use crate::store::{
    CorrectionLog, InsertOutcome, LedgerStore, PatternStore, RuleStore, StagingStore, StoreError,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    sessions: HashSet<SessionKey>,
    staged: Vec<StagedTransaction>,
    transactions: Vec<CommittedTransaction>,
    provenance: HashMap<(i64, String), i64>,
    rules: Vec<MerchantRule>,
    patterns: Vec<RecurringPattern>,
    corrections: Vec<UserCorrection>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_transaction(&mut self, tx: &NewTransaction) -> InsertOutcome {
        let key = (tx.user_id, tx.provenance_key.clone());
        if let Some(&existing) = self.provenance.get(&key) {
            return InsertOutcome::Existing(existing);
        }
        let id = self.next_id();
        self.transactions
            .push(CommittedTransaction::from_new(id, tx.clone(), Some(Utc::now())));
        self.provenance.insert(key, id);
        InsertOutcome::Inserted(id)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `session` (if needed) and appends `records` to it.
    pub async fn stage(&self, session: &SessionKey, records: Vec<NewStagedTransaction>) -> Vec<i64> {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.clone());
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = inner.next_id();
            inner
                .staged
                .push(StagedTransaction::from_new(id, session.clone(), record));
            ids.push(id);
        }
        ids
    }

    pub async fn committed(&self, user_id: i64) -> Vec<CommittedTransaction> {
        let inner = self.inner.lock().await;
        inner
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn corrections(&self, user_id: i64) -> Vec<UserCorrection> {
        let inner = self.inner.lock().await;
        inner
            .corrections
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn session_exists(&self, session: &SessionKey) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.sessions.contains(session))
    }

    async fn staged_transactions(
        &self,
        session: &SessionKey,
        source: Source,
    ) -> Result<Vec<StagedTransaction>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .staged
            .iter()
            .filter(|t| &t.session == session && t.source == source)
            .cloned()
            .collect())
    }

    async fn clear_session(&self, session: &SessionKey) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(session);
        let before = inner.staged.len();
        inner.staged.retain(|t| &t.session != session);
        Ok((before - inner.staged.len()) as u64)
    }

    async fn commit_staged(
        &self,
        session: &SessionKey,
        staged_ids: &[i64],
        tx: &NewTransaction,
    ) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let is_member =
            |t: &StagedTransaction| &t.session == session && staged_ids.contains(&t.id);

        let prior = inner
            .staged
            .iter()
            .filter(|t| is_member(*t))
            .find_map(|t| t.committed_as);
        let outcome = match prior {
            Some(id) => InsertOutcome::Existing(id),
            None => inner.insert_transaction(tx),
        };
        for row in inner.staged.iter_mut().filter(|t| is_member(&**t)) {
            row.committed_as.get_or_insert(outcome.id());
        }
        Ok(outcome)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_by_provenance(
        &self,
        user_id: i64,
        provenance_key: &str,
    ) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .provenance
            .get(&(user_id, provenance_key.to_string()))
            .copied())
    }

    async fn insert_transaction(&self, tx: &NewTransaction) -> Result<InsertOutcome, StoreError> {
        Ok(self.inner.lock().await.insert_transaction(tx))
    }

    async fn merchant_history(
        &self,
        user_id: i64,
        merchant_key: &str,
        range: DateRange,
    ) -> Result<Vec<CommittedTransaction>, StoreError> {
        let inner = self.inner.lock().await;
        let mut history: Vec<CommittedTransaction> = inner
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && range.contains(t.date))
            .filter(|t| {
                let name = t.merchant.as_deref().unwrap_or(&t.description);
                tally_core::merchant_key(name).is_some_and(|k| keys_match(&k, merchant_key))
            })
            .cloned()
            .collect();
        history.sort_by_key(|t| (t.date, t.id));
        Ok(history)
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn rules_for_user(&self, user_id: i64) -> Result<Vec<MerchantRule>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rules
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_rule(
        &self,
        user_id: i64,
        merchant_key: &str,
    ) -> Result<Option<MerchantRule>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rules
            .iter()
            .find(|r| r.user_id == user_id && r.merchant_key().as_deref() == Some(merchant_key))
            .cloned())
    }

    async fn insert_rule(&self, rule: &NewMerchantRule) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = rule.name_key();
        if let Some(existing) = inner
            .rules
            .iter()
            .find(|r| r.user_id == rule.user_id && r.name_key() == key)
        {
            return Ok(InsertOutcome::Existing(existing.id));
        }
        let id = inner.next_id();
        inner
            .rules
            .push(MerchantRule::from_new(id, rule.clone(), Utc::now()));
        Ok(InsertOutcome::Inserted(id))
    }

    async fn record_rule_applied(
        &self,
        rule_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(rule) = inner.rules.iter_mut().find(|r| r.id == rule_id) {
            rule.applied_count += 1;
            rule.last_applied = Some(at);
        }
        Ok(())
    }

    async fn set_rule_pattern(
        &self,
        rule_id: i64,
        pattern: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.merchant_pattern = pattern.map(str::to_string);
                true
            }
            None => false,
        })
    }

    async fn set_rule_priority(&self, rule_id: i64, priority: i32) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(match inner.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.priority = priority;
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl PatternStore for MemoryStore {
    async fn find_pattern(
        &self,
        user_id: i64,
        merchant_key: &str,
    ) -> Result<Option<RecurringPattern>, StoreError> {
        let inner = self.inner.lock().await;
        let candidates = inner.patterns.iter().filter(|p| p.user_id == user_id);
        let mut best: Option<(bool, usize, &RecurringPattern)> = None;
        for pattern in candidates {
            let Some(key) = pattern.merchant_key() else {
                continue;
            };
            if !keys_match(&key, merchant_key) {
                continue;
            }
            let rank = (key == merchant_key, key.len());
            if best.map_or(true, |(exact, len, _)| rank > (exact, len)) {
                best = Some((rank.0, rank.1, pattern));
            }
        }
        Ok(best.map(|(_, _, p)| p.clone()))
    }

    async fn insert_pattern(
        &self,
        pattern: &NewRecurringPattern,
    ) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = pattern.merchant_key();
        if let Some(existing) = inner
            .patterns
            .iter()
            .find(|p| p.user_id == pattern.user_id && p.merchant_key() == key)
        {
            return Ok(InsertOutcome::Existing(existing.id));
        }
        let id = inner.next_id();
        inner
            .patterns
            .push(RecurringPattern::from_new(id, pattern.clone()));
        Ok(InsertOutcome::Inserted(id))
    }

    async fn update_pattern(
        &self,
        pattern: &RecurringPattern,
        expected_detected_from: u32,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.patterns.iter_mut().find(|p| p.id == pattern.id) {
            Some(stored) if stored.detected_from == expected_detected_from => {
                *stored = pattern.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CorrectionLog for MemoryStore {
    async fn append_correction(&self, correction: &NewUserCorrection) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        inner
            .corrections
            .push(UserCorrection::from_new(id, correction.clone(), Utc::now()));
        Ok(id)
    }

    async fn corrections_for_merchant(
        &self,
        user_id: i64,
        correction_type: CorrectionType,
        key: &str,
    ) -> Result<Vec<UserCorrection>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .corrections
            .iter()
            .filter(|c| c.user_id == user_id && c.correction_type == correction_type)
            .filter(|c| {
                c.merchant_name
                    .as_deref()
                    .and_then(merchant_key)
                    .is_some_and(|k| keys_match(&k, key))
            })
            .cloned()
            .collect())
    }

    async fn mark_applied_as_rule(&self, correction_ids: &[i64]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for correction in inner
            .corrections
            .iter_mut()
            .filter(|c| correction_ids.contains(&c.id))
        {
            correction.applied_as_rule = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tally_core::{Frequency, Money};

    fn pattern(user_id: i64, merchant: &str) -> NewRecurringPattern {
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        NewRecurringPattern {
            user_id,
            merchant_name: merchant.to_string(),
            category: None,
            profile_type: None,
            average_amount: Money::from_cents(999),
            frequency: Frequency::Monthly,
            detected_from: 3,
            last_occurrence: day,
            next_expected: Frequency::Monthly.advance(day),
            confidence: 0.6,
        }
    }

    #[tokio::test]
    async fn find_pattern_prefers_exact_key() {
        let store = MemoryStore::new();
        store.insert_pattern(&pattern(1, "Spotify Premium")).await.unwrap();
        let exact = store.insert_pattern(&pattern(1, "Spotify")).await.unwrap().id();
        let found = store.find_pattern(1, "spotify").await.unwrap().unwrap();
        assert_eq!(found.id, exact);
    }

    #[tokio::test]
    async fn find_pattern_falls_back_to_word_prefix() {
        let store = MemoryStore::new();
        let id = store.insert_pattern(&pattern(1, "Spotify")).await.unwrap().id();
        let found = store.find_pattern(1, "spotify usa").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(store.find_pattern(2, "spotify").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conditional_update_detects_stale_version() {
        let store = MemoryStore::new();
        let id = store.insert_pattern(&pattern(1, "Gym")).await.unwrap().id();
        let mut stored = store.find_pattern(1, "gym").await.unwrap().unwrap();
        assert_eq!(stored.id, id);
        stored.detected_from = 4;
        assert!(store.update_pattern(&stored, 3).await.unwrap());
        // A second writer still holding version 3 loses.
        assert!(!store.update_pattern(&stored, 3).await.unwrap());
    }

    #[tokio::test]
    async fn clear_session_removes_only_that_session() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let a = SessionKey::new(1, "a");
        let b = SessionKey::new(1, "b");
        let row = || NewStagedTransaction::new(Source::Manual, day, Money::from_cents(1), "x");
        store.stage(&a, vec![row(), row()]).await;
        store.stage(&b, vec![row()]).await;
        assert_eq!(store.clear_session(&a).await.unwrap(), 2);
        assert!(!store.session_exists(&a).await.unwrap());
        assert_eq!(store.staged_transactions(&b, Source::Manual).await.unwrap().len(), 1);
    }

    fn ledger_record(user_id: i64, provenance_key: &str) -> NewTransaction {
        NewTransaction {
            user_id,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            amount: Money::from_cents(500),
            description: "COFFEE".into(),
            merchant: None,
            category: None,
            profile_type: None,
            notes: None,
            confidence: 0.5,
            is_recurring: false,
            provenance_key: provenance_key.to_string(),
        }
    }

    #[tokio::test]
    async fn commit_staged_marks_rows_and_attaches_latecomers() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let session = SessionKey::new(1, "s");
        let row = |source| NewStagedTransaction::new(source, day, Money::from_cents(500), "coffee");
        let ids = store.stage(&session, vec![row(Source::Document)]).await;

        let first = store.commit_staged(&session, &ids, &ledger_record(1, "a")).await.unwrap();
        assert!(first.is_new());

        let late = store.stage(&session, vec![row(Source::Manual)]).await;
        let pair = [ids[0], late[0]];
        let second = store.commit_staged(&session, &pair, &ledger_record(1, "b")).await.unwrap();
        assert_eq!(second, InsertOutcome::Existing(first.id()));
        assert_eq!(store.committed(1).await.len(), 1);

        let manual = store.staged_transactions(&session, Source::Manual).await.unwrap();
        assert_eq!(manual[0].committed_as, Some(first.id()));
    }
}
