//! Merchant intelligence applied to a record on its way into the ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tally_core::{merchant_key, CommittedTransaction, ConfidenceConfig, DateRange, EngineConfig, NewTransaction};
use tracing::debug;

use crate::confidence::{enhanced_confidence, ConfidenceSignals};
use crate::recurring::{Observation, RecurringDetection, RecurringDetector};
use crate::rules::{MerchantRuleEngine, RuleMatch};
use crate::store::{LedgerStore, PatternStore, RuleStore, StoreError};

/// Hooks around the first commit of a record. `enrich` annotates it before
/// the insert and must not write; `learn` runs only after the insert
/// actually happened, so counters never move for a record that lost a race.
#[async_trait]
pub trait Enrich: Send + Sync {
    async fn enrich(&self, tx: &mut NewTransaction) -> Result<(), StoreError>;

    async fn learn(&self, transaction_id: i64, tx: &NewTransaction) -> Result<(), StoreError>;
}

fn observe(merchant: &str, tx: &NewTransaction) -> Observation {
    Observation {
        merchant_name: merchant.to_string(),
        amount: tx.amount,
        date: tx.date,
        category: tx.category.clone(),
        profile_type: tx.profile_type.clone(),
        transaction_id: None,
    }
}

/// Most common category among a merchant's past transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalCategory {
    pub category: String,
    /// Fraction of categorized records carrying `category`.
    pub share: f32,
    pub records: usize,
}

/// `None` when fewer than `min_records` past records are categorized.
/// Equal counts resolve to the alphabetically first category.
pub fn dominant_category(
    history: &[CommittedTransaction],
    min_records: usize,
) -> Option<HistoricalCategory> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for category in history.iter().filter_map(|t| t.category.as_deref()) {
        *counts.entry(category).or_default() += 1;
    }
    let records: usize = counts.values().sum();
    if records == 0 || records < min_records {
        return None;
    }

    let (category, count) = counts
        .into_iter()
        .fold(None, |best: Option<(&str, usize)>, (cat, n)| match best {
            Some((_, best_n)) if best_n >= n => best,
            _ => Some((cat, n)),
        })?;
    Some(HistoricalCategory {
        category: category.to_string(),
        share: count as f32 / records as f32,
        records,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MerchantInsight {
    pub rule: RuleMatch,
    pub historical: Option<HistoricalCategory>,
    pub recurring: RecurringDetection,
}

pub struct MerchantIntelligence<S> {
    store: Arc<S>,
    rules: MerchantRuleEngine<S>,
    recurring: RecurringDetector<S>,
    config: ConfidenceConfig,
}

impl<S: RuleStore + PatternStore + LedgerStore> MerchantIntelligence<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        MerchantIntelligence {
            rules: MerchantRuleEngine::new(store.clone(), config.rules.clone()),
            recurring: RecurringDetector::new(store.clone(), config.recurring.clone()),
            store,
            config: config.confidence.clone(),
        }
    }

    pub fn rules(&self) -> &MerchantRuleEngine<S> {
        &self.rules
    }

    pub fn recurring(&self) -> &RecurringDetector<S> {
        &self.recurring
    }

    /// Fills missing classification from rules or history, then scores
    /// the record and flags recurring payments. Records without a
    /// merchant are left untouched. Reads only; [`Self::learn`] records
    /// the rule hit and the recurring observation.
    pub async fn classify(&self, tx: &mut NewTransaction) -> Result<Option<MerchantInsight>, StoreError> {
        let Some(merchant) = tx.merchant.clone() else {
            return Ok(None);
        };
        let Some(key) = merchant_key(&merchant) else {
            return Ok(None);
        };

        let rule = self.rules.lookup(tx.user_id, &merchant).await?;
        let range = DateRange::lookback(tx.date, self.config.history_lookback_days);
        let history = self.store.merchant_history(tx.user_id, &key, range).await?;
        let historical = dominant_category(&history, self.config.history_min_records);

        if rule.matched && rule.auto_apply {
            if tx.category.is_none() {
                tx.category = rule.category.clone();
            }
            if tx.profile_type.is_none() {
                tx.profile_type = rule.profile_type.clone();
            }
        }
        if tx.category.is_none() {
            if let Some(h) = historical
                .as_ref()
                .filter(|h| h.share > self.config.history_min_confidence)
            {
                tx.category = Some(h.category.clone());
            }
        }

        let observation = observe(&merchant, tx);
        let recurring = self.recurring.preview(tx.user_id, &observation).await?;

        let signals = ConfidenceSignals {
            base: tx.confidence,
            has_historical_pattern: historical.is_some(),
            historical_confidence: historical.as_ref().map_or(0.0, |h| h.share),
            has_merchant_rule: rule.matched,
            has_recurring_pattern: recurring.is_recurring,
        };
        tx.confidence = enhanced_confidence(&self.config, &signals);
        tx.is_recurring = recurring.is_recurring;

        debug!(
            merchant = %observation.merchant_name,
            rule = rule.matched,
            recurring = recurring.is_recurring,
            confidence = tx.confidence,
            "Enriched transaction"
        );
        Ok(Some(MerchantInsight {
            rule,
            historical,
            recurring,
        }))
    }

    /// Counts the rule hit and folds the payment into its recurring
    /// pattern, for a record stored in the ledger as `transaction_id`.
    pub async fn learn(&self, transaction_id: i64, tx: &NewTransaction) -> Result<(), StoreError> {
        let Some(merchant) = tx.merchant.as_deref().filter(|m| merchant_key(m).is_some()) else {
            return Ok(());
        };
        self.rules.apply(tx.user_id, merchant).await?;

        let mut observation = observe(merchant, tx);
        observation.transaction_id = Some(transaction_id);
        self.recurring.detect(tx.user_id, &observation).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: RuleStore + PatternStore + LedgerStore> Enrich for MerchantIntelligence<S> {
    async fn enrich(&self, tx: &mut NewTransaction) -> Result<(), StoreError> {
        self.classify(tx).await.map(|_| ())
    }

    async fn learn(&self, transaction_id: i64, tx: &NewTransaction) -> Result<(), StoreError> {
        MerchantIntelligence::learn(self, transaction_id, tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::{Days, NaiveDate};
    use tally_core::{Money, NewMerchantRule};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    fn tx(merchant: Option<&str>, date: NaiveDate, category: Option<&str>) -> NewTransaction {
        NewTransaction {
            user_id: 1,
            date,
            amount: Money::from_cents(-4200),
            description: merchant.unwrap_or("CARD PAYMENT").to_uppercase(),
            merchant: merchant.map(str::to_string),
            category: category.map(str::to_string),
            profile_type: None,
            notes: None,
            confidence: 0.5,
            is_recurring: false,
            provenance_key: format!("{merchant:?}-{date}"),
        }
    }

    async fn seed(store: &MemoryStore, merchant: &str, days_ago: &[u64], category: Option<&str>) {
        for days in days_ago {
            let t = tx(Some(merchant), today() - Days::new(*days), category);
            store.insert_transaction(&t).await.unwrap();
        }
    }

    fn intelligence(store: Arc<MemoryStore>) -> MerchantIntelligence<MemoryStore> {
        MerchantIntelligence::new(store, &EngineConfig::default())
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn dominant_category_needs_enough_records() {
        let day = today();
        let committed = |id, category: Option<&str>| {
            CommittedTransaction::from_new(id, tx(Some("X"), day, category), None)
        };
        assert_eq!(dominant_category(&[committed(1, Some("Travel"))], 2), None);

        let history = [
            committed(1, Some("Travel")),
            committed(2, Some("Meals")),
            committed(3, Some("Travel")),
            committed(4, None),
        ];
        let found = dominant_category(&history, 2).unwrap();
        assert_eq!(found.category, "Travel");
        assert_eq!(found.records, 3);
        assert!(approx(found.share, 2.0 / 3.0));

        let tie = dominant_category(&[committed(5, Some("Travel")), committed(6, Some("Meals"))], 2)
            .unwrap();
        assert_eq!(tie.category, "Meals");
        assert!(approx(tie.share, 0.5));
    }

    #[tokio::test]
    async fn auto_apply_rule_fills_classification() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_rule(&NewMerchantRule::new(1, "Figma").with_category("Software").with_profile("business"))
            .await
            .unwrap();

        let mut record = tx(Some("Figma"), today(), None);
        let intelligence = intelligence(store.clone());
        let insight = intelligence.classify(&mut record).await.unwrap().unwrap();

        assert!(insight.rule.matched);
        assert_eq!(record.category.as_deref(), Some("Software"));
        assert_eq!(record.profile_type.as_deref(), Some("business"));
        assert!(approx(record.confidence, 0.65));
        assert!(!record.is_recurring);
        assert_eq!(store.rules_for_user(1).await.unwrap()[0].applied_count, 0);

        let id = store.insert_transaction(&record).await.unwrap().id();
        intelligence.learn(id, &record).await.unwrap();
        assert_eq!(store.rules_for_user(1).await.unwrap()[0].applied_count, 1);
    }

    #[tokio::test]
    async fn rule_never_overrides_existing_category() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_rule(&NewMerchantRule::new(1, "Figma").with_category("Software"))
            .await
            .unwrap();
        let mut record = tx(Some("Figma"), today(), Some("Design"));
        intelligence(store).classify(&mut record).await.unwrap();
        assert_eq!(record.category.as_deref(), Some("Design"));
    }

    #[tokio::test]
    async fn history_supplies_category_and_boost() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "Delta Air", &[40, 37, 26], Some("Travel")).await;

        let mut record = tx(Some("Delta Air Lines"), today(), None);
        let insight = intelligence(store).classify(&mut record).await.unwrap().unwrap();

        assert_eq!(insight.historical.as_ref().map(|h| h.records), Some(3));
        assert!(!insight.recurring.is_recurring);
        assert_eq!(record.category.as_deref(), Some("Travel"));
        assert!(approx(record.confidence, 0.6));
    }

    #[tokio::test]
    async fn monthly_history_marks_recurring() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "Netflix", &[61, 30], None).await;

        let mut record = tx(Some("Netflix"), today(), None);
        let intelligence = intelligence(store.clone());
        intelligence.classify(&mut record).await.unwrap();

        assert!(record.is_recurring);
        assert!(approx(record.confidence, 0.55));
        assert!(store.find_pattern(1, "netflix").await.unwrap().is_none());

        let id = store.insert_transaction(&record).await.unwrap().id();
        intelligence.learn(id, &record).await.unwrap();
        let pattern = store.find_pattern(1, "netflix").await.unwrap().unwrap();
        assert_eq!(pattern.detected_from, 3);
    }

    #[tokio::test]
    async fn records_without_merchant_are_untouched() {
        let store = Arc::new(MemoryStore::new());
        let mut record = tx(None, today(), None);
        let before = record.clone();
        assert!(intelligence(store).enrich(&mut record).await.is_ok());
        assert_eq!(record, before);
    }
}
