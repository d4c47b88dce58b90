use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_core::{CorrectionType, NewMerchantRule, NewUserCorrection, RuleConfig};
use thiserror::Error;
use tracing::info;

use crate::store::{CorrectionLog, InsertOutcome, RuleStore, StoreError};

#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("Corrected value is empty")]
    EmptyValue,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionOutcome {
    pub correction_id: i64,
    pub created_rule_id: Option<i64>,
}

/// Records user corrections and promotes repeated classification
/// corrections for one merchant into a merchant rule.
pub struct CorrectionLearner<S> {
    store: Arc<S>,
    config: RuleConfig,
}

impl<S: CorrectionLog + RuleStore> CorrectionLearner<S> {
    pub fn new(store: Arc<S>, config: RuleConfig) -> Self {
        CorrectionLearner { store, config }
    }

    pub async fn record(
        &self,
        correction: NewUserCorrection,
    ) -> Result<CorrectionOutcome, CorrectionError> {
        if correction.corrected_value.trim().is_empty() {
            return Err(CorrectionError::EmptyValue);
        }

        let correction_id = self.store.append_correction(&correction).await?;
        let created_rule_id = if correction.correction_type.is_classification() {
            self.promote(&correction).await?
        } else {
            None
        };

        Ok(CorrectionOutcome {
            correction_id,
            created_rule_id,
        })
    }

    async fn promote(&self, correction: &NewUserCorrection) -> Result<Option<i64>, StoreError> {
        let (Some(name), Some(key)) = (correction.merchant_name.as_deref(), correction.merchant_key())
        else {
            return Ok(None);
        };

        let counted = self
            .store
            .corrections_for_merchant(correction.user_id, correction.correction_type, &key)
            .await?;
        if counted.len() < self.config.promotion_threshold {
            return Ok(None);
        }
        if self.store.find_rule(correction.user_id, &key).await?.is_some() {
            return Ok(None);
        }

        let rule = synthesize_rule(&self.config, correction.user_id, name, correction);
        match self.store.insert_rule(&rule).await? {
            InsertOutcome::Inserted(rule_id) => {
                let ids: Vec<i64> = counted.iter().map(|c| c.id).collect();
                self.store.mark_applied_as_rule(&ids).await?;
                info!(
                    user_id = correction.user_id,
                    merchant = name,
                    rule_id,
                    corrections = ids.len(),
                    "Learned merchant rule from corrections"
                );
                Ok(Some(rule_id))
            }
            // Created concurrently; never overwrite.
            InsertOutcome::Existing(_) => Ok(None),
        }
    }
}

/// Rule carrying the corrected value in the field the correction targets.
pub fn synthesize_rule(
    config: &RuleConfig,
    user_id: i64,
    merchant_name: &str,
    correction: &NewUserCorrection,
) -> NewMerchantRule {
    let value = correction.corrected_value.trim();
    let rule = NewMerchantRule::new(user_id, merchant_name).with_priority(config.learned_rule_priority);
    match correction.correction_type {
        CorrectionType::Profile => rule.with_profile(value),
        _ => rule.with_category(value),
    }
}
