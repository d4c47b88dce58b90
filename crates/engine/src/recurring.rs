use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tally_core::{
    merchant_key, DateRange, Frequency, FrequencyBand, Money, NewRecurringPattern,
    RecurringConfig, RecurringPattern,
};
use tracing::{debug, warn};

use crate::store::{InsertOutcome, LedgerStore, PatternStore, StoreError};

/// One payment to a merchant, as seen by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub merchant_name: String,
    pub amount: Money,
    pub date: NaiveDate,
    pub category: Option<String>,
    pub profile_type: Option<String>,
    /// Ledger id of the payment when it is already committed. Excluded
    /// from its own history.
    pub transaction_id: Option<i64>,
}

impl Observation {
    pub fn new(merchant_name: &str, amount: Money, date: NaiveDate) -> Self {
        Observation {
            merchant_name: merchant_name.to_string(),
            amount,
            date,
            category: None,
            profile_type: None,
            transaction_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringDetection {
    pub is_recurring: bool,
    pub frequency: Option<Frequency>,
    pub confidence: Option<f32>,
    pub next_expected: Option<NaiveDate>,
    pub pattern_id: Option<i64>,
}

impl RecurringDetection {
    pub fn not_recurring() -> Self {
        RecurringDetection {
            is_recurring: false,
            frequency: None,
            confidence: None,
            next_expected: None,
            pattern_id: None,
        }
    }

    fn from_pattern(pattern: &RecurringPattern) -> Self {
        RecurringDetection {
            is_recurring: true,
            frequency: Some(pattern.frequency),
            confidence: Some(pattern.confidence),
            next_expected: Some(pattern.next_expected),
            pattern_id: Some(pattern.id),
        }
    }

    fn from_new(pattern: &NewRecurringPattern) -> Self {
        RecurringDetection {
            is_recurring: true,
            frequency: Some(pattern.frequency),
            confidence: Some(pattern.confidence),
            next_expected: Some(pattern.next_expected),
            pattern_id: None,
        }
    }
}

/// Band containing `average_days`, first match in band order.
pub fn classify_interval(average_days: f64, bands: &[FrequencyBand]) -> Option<Frequency> {
    bands
        .iter()
        .find(|band| band.contains(average_days))
        .map(|band| band.frequency)
}

/// Mean gap between consecutive distinct dates. `None` below two dates.
pub fn average_interval(dates: &[NaiveDate]) -> Option<f64> {
    let mut dates = dates.to_vec();
    dates.sort_unstable();
    dates.dedup();
    let (first, last) = (dates.first()?, dates.last()?);
    if dates.len() < 2 {
        return None;
    }
    Some((*last - *first).num_days() as f64 / (dates.len() - 1) as f64)
}

pub fn initial_confidence(config: &RecurringConfig, observations: usize) -> f32 {
    (observations as f32 * config.initial_confidence_per_observation)
        .min(config.initial_confidence_cap)
}

/// Whether `amount` lies within `tolerance` (relative) of `average`.
fn within_tolerance(average: Money, amount: Money, tolerance: f64) -> bool {
    let diff = (amount - average).abs().as_decimal().to_f64().unwrap_or(f64::MAX);
    let base = average.abs().as_decimal().to_f64().unwrap_or(0.0);
    diff <= base * tolerance
}

/// Folds one in-tolerance observation into `pattern`.
fn continue_pattern(
    config: &RecurringConfig,
    pattern: &RecurringPattern,
    obs: &Observation,
) -> RecurringPattern {
    let last_occurrence = pattern.last_occurrence.max(obs.date);
    RecurringPattern {
        average_amount: pattern
            .average_amount
            .running_mean(pattern.detected_from, obs.amount),
        detected_from: pattern.detected_from.saturating_add(1),
        last_occurrence,
        next_expected: pattern.frequency.advance(last_occurrence),
        confidence: (pattern.confidence + config.confidence_step).min(config.confidence_cap),
        category: pattern.category.clone().or_else(|| obs.category.clone()),
        profile_type: pattern
            .profile_type
            .clone()
            .or_else(|| obs.profile_type.clone()),
        ..pattern.clone()
    }
}

/// Infers and maintains per-merchant payment cadence.
pub struct RecurringDetector<S> {
    store: Arc<S>,
    config: RecurringConfig,
}

impl<S: PatternStore + LedgerStore> RecurringDetector<S> {
    pub fn new(store: Arc<S>, config: RecurringConfig) -> Self {
        RecurringDetector { store, config }
    }

    pub async fn detect(
        &self,
        user_id: i64,
        obs: &Observation,
    ) -> Result<RecurringDetection, StoreError> {
        let Some(key) = merchant_key(&obs.merchant_name) else {
            return Ok(RecurringDetection::not_recurring());
        };

        let mut last_seen = None;
        for _ in 0..self.config.max_update_attempts.max(1) {
            let Some(pattern) = self.store.find_pattern(user_id, &key).await? else {
                return self.infer(user_id, &key, obs).await;
            };
            if !within_tolerance(pattern.average_amount, obs.amount, self.config.amount_tolerance) {
                debug!(
                    merchant = %obs.merchant_name,
                    amount = %obs.amount,
                    average = %pattern.average_amount,
                    "Amount outside recurring tolerance"
                );
                return Ok(RecurringDetection::not_recurring());
            }

            let updated = continue_pattern(&self.config, &pattern, obs);
            if self.store.update_pattern(&updated, pattern.detected_from).await? {
                return Ok(RecurringDetection::from_pattern(&updated));
            }
            last_seen = Some(pattern);
        }

        warn!(
            merchant = %obs.merchant_name,
            attempts = self.config.max_update_attempts,
            "Recurring pattern update kept losing to concurrent writers"
        );
        Ok(last_seen
            .as_ref()
            .map(RecurringDetection::from_pattern)
            .unwrap_or_else(RecurringDetection::not_recurring))
    }

    /// What `detect` would report for `obs`, without writing anything.
    pub async fn preview(
        &self,
        user_id: i64,
        obs: &Observation,
    ) -> Result<RecurringDetection, StoreError> {
        let Some(key) = merchant_key(&obs.merchant_name) else {
            return Ok(RecurringDetection::not_recurring());
        };
        match self.store.find_pattern(user_id, &key).await? {
            Some(pattern)
                if within_tolerance(pattern.average_amount, obs.amount, self.config.amount_tolerance) =>
            {
                Ok(RecurringDetection::from_pattern(&continue_pattern(&self.config, &pattern, obs)))
            }
            Some(_) => Ok(RecurringDetection::not_recurring()),
            None => Ok(self
                .plan(user_id, &key, obs)
                .await?
                .as_ref()
                .map_or_else(RecurringDetection::not_recurring, RecurringDetection::from_new)),
        }
    }

    async fn infer(
        &self,
        user_id: i64,
        key: &str,
        obs: &Observation,
    ) -> Result<RecurringDetection, StoreError> {
        let Some(pattern) = self.plan(user_id, key, obs).await? else {
            return Ok(RecurringDetection::not_recurring());
        };

        match self.store.insert_pattern(&pattern).await? {
            InsertOutcome::Inserted(id) => {
                debug!(
                    merchant = %obs.merchant_name,
                    frequency = %pattern.frequency,
                    observations = pattern.detected_from,
                    "Recurring pattern detected"
                );
                Ok(RecurringDetection::from_pattern(&RecurringPattern::from_new(id, pattern)))
            }
            // Another writer created it first; report theirs untouched.
            InsertOutcome::Existing(_) => Ok(self
                .store
                .find_pattern(user_id, key)
                .await?
                .as_ref()
                .map(RecurringDetection::from_pattern)
                .unwrap_or_else(RecurringDetection::not_recurring)),
        }
    }

    /// New pattern inferred from the merchant's history plus `obs`, if the
    /// intervals fall in a frequency band.
    async fn plan(
        &self,
        user_id: i64,
        key: &str,
        obs: &Observation,
    ) -> Result<Option<NewRecurringPattern>, StoreError> {
        let range = DateRange::lookback(obs.date, self.config.lookback_days);
        let mut history = self.store.merchant_history(user_id, key, range).await?;
        history.retain(|t| Some(t.id) != obs.transaction_id);
        if history.len() < self.config.min_prior_observations {
            return Ok(None);
        }

        let mut dates: Vec<NaiveDate> = history.iter().map(|t| t.date).collect();
        dates.push(obs.date);
        let Some(frequency) =
            average_interval(&dates).and_then(|avg| classify_interval(avg, &self.config.bands))
        else {
            return Ok(None);
        };

        let mut amounts: Vec<Money> = history.iter().map(|t| t.amount).collect();
        amounts.push(obs.amount);
        let observations = amounts.len();
        let last_occurrence = dates.iter().copied().max().unwrap_or(obs.date);

        Ok(Some(NewRecurringPattern {
            user_id,
            merchant_name: obs.merchant_name.clone(),
            category: obs.category.clone(),
            profile_type: obs.profile_type.clone(),
            average_amount: Money::mean(&amounts).unwrap_or(obs.amount),
            frequency,
            detected_from: u32::try_from(observations).unwrap_or(u32::MAX),
            last_occurrence,
            next_expected: frequency.advance(last_occurrence),
            confidence: initial_confidence(&self.config, observations),
        }))
    }
}
