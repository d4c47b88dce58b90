use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::merchant::merchant_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionType {
    Category,
    Profile,
    Merchant,
    Amount,
    Date,
}

impl CorrectionType {
    /// Corrections that can be promoted into a merchant rule.
    pub fn is_classification(self) -> bool {
        matches!(self, CorrectionType::Category | CorrectionType::Profile)
    }
}

impl fmt::Display for CorrectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionType::Category => write!(f, "CATEGORY"),
            CorrectionType::Profile => write!(f, "PROFILE"),
            CorrectionType::Merchant => write!(f, "MERCHANT"),
            CorrectionType::Amount => write!(f, "AMOUNT"),
            CorrectionType::Date => write!(f, "DATE"),
        }
    }
}

impl std::str::FromStr for CorrectionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CATEGORY" => Ok(CorrectionType::Category),
            "PROFILE" => Ok(CorrectionType::Profile),
            "MERCHANT" => Ok(CorrectionType::Merchant),
            "AMOUNT" => Ok(CorrectionType::Amount),
            "DATE" => Ok(CorrectionType::Date),
            other => Err(format!("Unknown correction type: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUserCorrection {
    pub user_id: i64,
    pub transaction_id: Option<i64>,
    pub correction_type: CorrectionType,
    pub original_value: Option<String>,
    pub corrected_value: String,
    pub merchant_name: Option<String>,
}

impl NewUserCorrection {
    pub fn new(user_id: i64, correction_type: CorrectionType, corrected_value: &str) -> Self {
        NewUserCorrection {
            user_id,
            transaction_id: None,
            correction_type,
            original_value: None,
            corrected_value: corrected_value.to_string(),
            merchant_name: None,
        }
    }

    pub fn for_merchant(mut self, merchant_name: &str) -> Self {
        self.merchant_name = Some(merchant_name.to_string());
        self
    }

    pub fn for_transaction(mut self, transaction_id: i64) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn replacing(mut self, original_value: &str) -> Self {
        self.original_value = Some(original_value.to_string());
        self
    }

    pub fn merchant_key(&self) -> Option<String> {
        self.merchant_name.as_deref().and_then(merchant_key)
    }
}

/// Written once; only `applied_as_rule` ever changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCorrection {
    pub id: i64,
    pub user_id: i64,
    pub transaction_id: Option<i64>,
    pub correction_type: CorrectionType,
    pub original_value: Option<String>,
    pub corrected_value: String,
    pub merchant_name: Option<String>,
    pub applied_as_rule: bool,
    pub created_at: DateTime<Utc>,
}

impl UserCorrection {
    pub fn from_new(id: i64, c: NewUserCorrection, created_at: DateTime<Utc>) -> Self {
        UserCorrection {
            id,
            user_id: c.user_id,
            transaction_id: c.transaction_id,
            correction_type: c.correction_type,
            original_value: c.original_value,
            corrected_value: c.corrected_value,
            merchant_name: c.merchant_name,
            applied_as_rule: false,
            created_at,
        }
    }

    pub fn merchant_key(&self) -> Option<String> {
        self.merchant_name.as_deref().and_then(merchant_key)
    }
}
