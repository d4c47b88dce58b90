use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::merchant::merchant_key;

/// Priority given to rules synthesized from user corrections.
pub const DEFAULT_RULE_PRIORITY: i32 = 50;

/// A rule's identity within its user's rule set: the trimmed, lowercased
/// merchant name.
pub fn rule_name_key(merchant_name: &str) -> String {
    merchant_name.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantRule {
    pub id: i64,
    pub user_id: i64,
    pub merchant_name: String,
    /// Optional regex tested case-insensitively against merchant names.
    pub merchant_pattern: Option<String>,
    pub suggested_category: Option<String>,
    pub profile_type: Option<String>,
    pub priority: i32,
    pub applied_count: i64,
    pub last_applied: Option<DateTime<Utc>>,
    pub auto_apply: bool,
    pub created_at: DateTime<Utc>,
}

impl MerchantRule {
    pub fn from_new(id: i64, rule: NewMerchantRule, created_at: DateTime<Utc>) -> Self {
        MerchantRule {
            id,
            user_id: rule.user_id,
            merchant_name: rule.merchant_name,
            merchant_pattern: rule.merchant_pattern,
            suggested_category: rule.suggested_category,
            profile_type: rule.profile_type,
            priority: rule.priority,
            applied_count: 0,
            last_applied: None,
            auto_apply: rule.auto_apply,
            created_at,
        }
    }

    pub fn merchant_key(&self) -> Option<String> {
        merchant_key(&self.merchant_name)
    }

    pub fn name_key(&self) -> String {
        rule_name_key(&self.merchant_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMerchantRule {
    pub user_id: i64,
    pub merchant_name: String,
    pub merchant_pattern: Option<String>,
    pub suggested_category: Option<String>,
    pub profile_type: Option<String>,
    pub priority: i32,
    pub auto_apply: bool,
}

impl NewMerchantRule {
    pub fn new(user_id: i64, merchant_name: &str) -> Self {
        NewMerchantRule {
            user_id,
            merchant_name: merchant_name.trim().to_string(),
            merchant_pattern: None,
            suggested_category: None,
            profile_type: None,
            priority: DEFAULT_RULE_PRIORITY,
            auto_apply: true,
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.suggested_category = Some(category.to_string());
        self
    }

    pub fn with_profile(mut self, profile_type: &str) -> Self {
        self.profile_type = Some(profile_type.to_string());
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.merchant_pattern = Some(pattern.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn merchant_key(&self) -> Option<String> {
        merchant_key(&self.merchant_name)
    }
    pub fn name_key(&self) -> String {
        rule_name_key(&self.merchant_name)
    }
}
