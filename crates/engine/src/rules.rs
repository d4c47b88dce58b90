use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tally_core::{rule_name_key, MerchantRule, NewMerchantRule, RuleConfig, RuleTieBreak};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{InsertOutcome, RuleStore, StoreError};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Invalid merchant pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Merchant name has no usable characters: '{0}'")]
    EmptyMerchant(String),
    #[error("A rule for merchant '{0}' already exists")]
    Duplicate(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMatchKind {
    Exact,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMatch {
    pub matched: bool,
    pub rule_id: Option<i64>,
    pub kind: Option<RuleMatchKind>,
    pub category: Option<String>,
    pub profile_type: Option<String>,
    pub auto_apply: bool,
}

impl RuleMatch {
    pub fn none() -> Self {
        RuleMatch {
            matched: false,
            rule_id: None,
            kind: None,
            category: None,
            profile_type: None,
            auto_apply: false,
        }
    }

    fn from_rule(rule: &MerchantRule, kind: RuleMatchKind) -> Self {
        RuleMatch {
            matched: true,
            rule_id: Some(rule.id),
            kind: Some(kind),
            category: rule.suggested_category.clone(),
            profile_type: rule.profile_type.clone(),
            auto_apply: rule.auto_apply,
        }
    }
}

/// Case-insensitive compile with a bounded program size; patterns are user data.
pub fn compile_pattern(pattern: &str, max_len: usize) -> Result<Regex, regex::Error> {
    if pattern.len() > max_len {
        return Err(regex::Error::CompiledTooBig(max_len));
    }
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(1 << 20)
        .build()
}

/// Compiled merchant patterns keyed by rule id. An entry is rebuilt only
/// when the rule's pattern text changes; patterns that fail to compile are
/// remembered as `None` and skipped.
#[derive(Default)]
pub struct PatternCache {
    compiled: Mutex<HashMap<i64, (String, Option<Regex>)>>,
}

impl PatternCache {
    fn get(&self, rule_id: i64, pattern: &str, max_len: usize) -> Option<Regex> {
        let mut compiled = self.compiled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((text, re)) = compiled.get(&rule_id) {
            if text == pattern {
                return re.clone();
            }
        }
        let re = match compile_pattern(pattern, max_len) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(rule_id, %pattern, error = %e, "skipping rule with invalid pattern");
                None
            }
        };
        compiled.insert(rule_id, (pattern.to_string(), re.clone()));
        re
    }

    pub fn len(&self) -> usize {
        self.compiled.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Two-phase selection. Phase one: an exact (case-insensitive) name match
/// wins regardless of priority. Phase two: patterns in priority order,
/// first match wins. Rules whose stored pattern no longer compiles are
/// skipped.
pub fn select_rule<'a>(
    rules: &'a [MerchantRule],
    merchant_name: &str,
    config: &RuleConfig,
    patterns: &PatternCache,
) -> Option<(&'a MerchantRule, RuleMatchKind)> {
    let needle = rule_name_key(merchant_name);
    if needle.is_empty() {
        return None;
    }

    if let Some(rule) = find_exact(rules, &needle, config.tie_break) {
        return Some((rule, RuleMatchKind::Exact));
    }

    let mut ordered: Vec<&MerchantRule> = rules
        .iter()
        .filter(|r| r.merchant_pattern.is_some())
        .collect();
    ordered.sort_by(|a, b| priority_order(a, b, config.tie_break));

    ordered.into_iter().find_map(|rule| {
        let pattern = rule.merchant_pattern.as_deref()?;
        patterns
            .get(rule.id, pattern, config.max_pattern_len)
            .filter(|re| re.is_match(merchant_name))
            .map(|_| (rule, RuleMatchKind::Pattern))
    })
}

fn find_exact<'a>(
    rules: &'a [MerchantRule],
    needle: &str,
    tie_break: RuleTieBreak,
) -> Option<&'a MerchantRule> {
    rules
        .iter()
        .filter(|r| r.name_key() == needle)
        .min_by(|a, b| priority_order(a, b, tie_break))
}

/// Highest priority first; equal priorities ordered by creation.
fn priority_order(a: &MerchantRule, b: &MerchantRule, tie_break: RuleTieBreak) -> Ordering {
    let by_age = (a.created_at, a.id).cmp(&(b.created_at, b.id));
    b.priority.cmp(&a.priority).then(match tie_break {
        RuleTieBreak::EarliestCreated => by_age,
        RuleTieBreak::LatestCreated => by_age.reverse(),
    })
}

pub struct MerchantRuleEngine<S> {
    store: Arc<S>,
    config: RuleConfig,
    patterns: PatternCache,
}

impl<S: RuleStore> MerchantRuleEngine<S> {
    pub fn new(store: Arc<S>, config: RuleConfig) -> Self {
        Self {
            store,
            config,
            patterns: PatternCache::default(),
        }
    }

    /// Winning rule for `merchant_name`, without recording a hit.
    pub async fn lookup(&self, user_id: i64, merchant_name: &str) -> Result<RuleMatch, StoreError> {
        let rules = self.store.rules_for_user(user_id).await?;
        Ok(select_rule(&rules, merchant_name, &self.config, &self.patterns)
            .map_or_else(RuleMatch::none, |(rule, kind)| RuleMatch::from_rule(rule, kind)))
    }

    /// Looks up the winning rule for `merchant_name` and records the hit.
    pub async fn apply(&self, user_id: i64, merchant_name: &str) -> Result<RuleMatch, StoreError> {
        let found = self.lookup(user_id, merchant_name).await?;
        if let Some(rule_id) = found.rule_id {
            self.record_hit(rule_id).await?;
            debug!(rule_id, merchant = merchant_name, kind = ?found.kind, "merchant rule applied");
        }
        Ok(found)
    }

    pub async fn record_hit(&self, rule_id: i64) -> Result<(), StoreError> {
        self.store.record_rule_applied(rule_id, Utc::now()).await
    }

    /// Validates the pattern up front so bad regexes never reach the store.
    pub async fn create_rule(&self, rule: NewMerchantRule) -> Result<i64, RuleError> {
        if rule.merchant_key().is_none() {
            return Err(RuleError::EmptyMerchant(rule.merchant_name));
        }
        if let Some(pattern) = rule.merchant_pattern.as_deref() {
            self.validate_pattern(pattern)?;
        }
        match self.store.insert_rule(&rule).await? {
            InsertOutcome::Inserted(id) => Ok(id),
            InsertOutcome::Existing(_) => Err(RuleError::Duplicate(rule.merchant_name)),
        }
    }

    pub async fn update_pattern(
        &self,
        rule_id: i64,
        pattern: Option<&str>,
    ) -> Result<bool, RuleError> {
        if let Some(p) = pattern {
            self.validate_pattern(p)?;
        }
        Ok(self.store.set_rule_pattern(rule_id, pattern).await?)
    }

    pub async fn update_priority(&self, rule_id: i64, priority: i32) -> Result<bool, RuleError> {
        Ok(self.store.set_rule_priority(rule_id, priority).await?)
    }

    pub async fn rules(&self, user_id: i64) -> Result<Vec<MerchantRule>, RuleError> {
        let mut rules = self.store.rules_for_user(user_id).await?;
        rules.sort_by(|a, b| priority_order(a, b, self.config.tie_break));
        Ok(rules)
    }

    pub fn validate_pattern(&self, pattern: &str) -> Result<(), RuleError> {
        compile_pattern(pattern, self.config.max_pattern_len)
            .map(|_| ())
            .map_err(|source| RuleError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn rule(id: i64, name: &str, pattern: Option<&str>, category: &str, priority: i32) -> MerchantRule {
        MerchantRule {
            id,
            user_id: 1,
            merchant_name: name.to_string(),
            merchant_pattern: pattern.map(str::to_string),
            suggested_category: Some(category.to_string()),
            profile_type: None,
            priority,
            applied_count: 0,
            last_applied: None,
            auto_apply: true,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(id),
        }
    }

    fn pick<'a>(rules: &'a [MerchantRule], merchant: &str) -> Option<&'a MerchantRule> {
        select_rule(rules, merchant, &RuleConfig::default(), &PatternCache::default()).map(|(r, _)| r)
    }

    #[test]
    fn exact_match_beats_higher_priority_pattern() {
        let rules = vec![
            rule(1, "Regex Catchall", Some("star"), "Meals", 90),
            rule(2, "Starbucks", None, "Coffee", 10),
        ];
        let (winner, kind) =
            select_rule(&rules, "STARBUCKS", &RuleConfig::default(), &PatternCache::default()).unwrap();
        assert_eq!(winner.suggested_category.as_deref(), Some("Coffee"));
        assert_eq!(kind, RuleMatchKind::Exact);
    }

    #[test]
    fn pattern_match_is_case_insensitive() {
        let rules = vec![rule(1, "Amazon", Some(r"^AMZN|AMAZON"), "Office Supplies", 5)];
        assert!(pick(&rules, "amzn mktp us").is_some());
        assert!(pick(&rules, "Amazon Marketplace").is_some());
        assert!(pick(&rules, "WHOLE FOODS").is_none());
    }

    #[test]
    fn priority_ordering_highest_wins() {
        let rules = vec![
            rule(1, "low", Some("github"), "Software", 1),
            rule(2, "high", Some("github"), "Development", 10),
        ];
        assert_eq!(pick(&rules, "GITHUB SPONSORS").unwrap().id, 2);
    }

    #[test]
    fn equal_priority_tie_break_is_configurable() {
        let rules = vec![
            rule(5, "later", Some("uber"), "Travel", 10),
            rule(4, "earlier", Some("uber"), "Meals", 10),
        ];
        assert_eq!(pick(&rules, "UBER EATS").unwrap().id, 4);

        let latest = RuleConfig {
            tie_break: RuleTieBreak::LatestCreated,
            ..RuleConfig::default()
        };
        let cache = PatternCache::default();
        assert_eq!(select_rule(&rules, "UBER EATS", &latest, &cache).unwrap().0.id, 5);
    }

    #[test]
    fn invalid_stored_pattern_is_skipped() {
        let rules = vec![
            rule(1, "broken", Some("(unclosed"), "Nope", 100),
            rule(2, "fine", Some("dropbox"), "Software", 1),
        ];
        assert_eq!(pick(&rules, "DROPBOX*PLUS").unwrap().id, 2);
    }

    #[test]
    fn rules_without_pattern_only_match_exactly() {
        let rules = vec![rule(1, "Shell", None, "Fuel", 10)];
        assert!(pick(&rules, "Shell Oil 5521").is_none());
        assert!(pick(&rules, " shell ").is_some());
    }

    #[test]
    fn blank_merchant_never_matches() {
        let rules = vec![rule(1, "x", Some(".*"), "Any", 1)];
        assert!(pick(&rules, "   ").is_none());
    }

    #[test]
    fn patterns_compile_once_until_changed() {
        let cache = PatternCache::default();
        let config = RuleConfig::default();
        let mut rules = vec![rule(1, "Lyft", Some("^lyft"), "Travel", 5)];
        for _ in 0..3 {
            assert!(select_rule(&rules, "LYFT RIDE", &config, &cache).is_some());
        }
        assert_eq!(cache.len(), 1);

        rules[0].merchant_pattern = Some("^uber".into());
        assert!(select_rule(&rules, "LYFT RIDE", &config, &cache).is_none());
        assert!(select_rule(&rules, "UBER TRIP", &config, &cache).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn lookup_leaves_counter_alone() {
        let store = Arc::new(MemoryStore::new());
        let engine = MerchantRuleEngine::new(store.clone(), RuleConfig::default());
        let id = engine.create_rule(NewMerchantRule::new(1, "Slack")).await.unwrap();

        assert_eq!(engine.lookup(1, "slack").await.unwrap().rule_id, Some(id));
        assert_eq!(engine.rules(1).await.unwrap()[0].applied_count, 0);
        engine.record_hit(id).await.unwrap();
        assert_eq!(engine.rules(1).await.unwrap()[0].applied_count, 1);
    }

    #[test]
    fn overlong_pattern_rejected() {
        assert!(compile_pattern(&"a".repeat(600), 512).is_err());
    }

    #[tokio::test]
    async fn apply_increments_counter() {
        let store = Arc::new(MemoryStore::new());
        let engine = MerchantRuleEngine::new(store.clone(), RuleConfig::default());
        let id = engine
            .create_rule(NewMerchantRule::new(1, "Adobe").with_category("Software"))
            .await
            .unwrap();

        let first = engine.apply(1, "adobe").await.unwrap();
        engine.apply(1, "ADOBE").await.unwrap();
        assert!(first.matched);
        assert_eq!(first.rule_id, Some(id));
        assert_eq!(first.category.as_deref(), Some("Software"));

        let rules = engine.rules(1).await.unwrap();
        assert_eq!(rules[0].applied_count, 2);
        assert!(rules[0].last_applied.is_some());
    }

    #[tokio::test]
    async fn apply_without_match_reports_unmatched() {
        let store = Arc::new(MemoryStore::new());
        let engine = MerchantRuleEngine::new(store, RuleConfig::default());
        let result = engine.apply(1, "Nobody").await.unwrap();
        assert_eq!(result, RuleMatch::none());
    }

    #[tokio::test]
    async fn rules_are_scoped_per_user() {
        let store = Arc::new(MemoryStore::new());
        let engine = MerchantRuleEngine::new(store, RuleConfig::default());
        engine
            .create_rule(NewMerchantRule::new(1, "Zoom").with_category("Software"))
            .await
            .unwrap();
        assert!(!engine.apply(2, "Zoom").await.unwrap().matched);
    }

    #[tokio::test]
    async fn create_rejects_invalid_pattern() {
        let store = Arc::new(MemoryStore::new());
        let engine = MerchantRuleEngine::new(store.clone(), RuleConfig::default());
        let err = engine
            .create_rule(NewMerchantRule::new(1, "Bad").with_pattern("[a-"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleError::InvalidPattern { .. }));
        assert!(engine.rules(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_merchant() {
        let store = Arc::new(MemoryStore::new());
        let engine = MerchantRuleEngine::new(store, RuleConfig::default());
        engine.create_rule(NewMerchantRule::new(1, "Acme Co")).await.unwrap();
        let err = engine.create_rule(NewMerchantRule::new(1, "ACME CO")).await.unwrap_err();
        assert!(matches!(err, RuleError::Duplicate(_)));
    }

    #[tokio::test]
    async fn names_sharing_a_merchant_key_are_distinct_rules() {
        let store = Arc::new(MemoryStore::new());
        let engine = MerchantRuleEngine::new(store, RuleConfig::default());
        let plain = engine.create_rule(NewMerchantRule::new(1, "Starbucks")).await.unwrap();
        let legal = engine.create_rule(NewMerchantRule::new(1, "Starbucks Inc")).await.unwrap();
        assert_ne!(plain, legal);
        assert_eq!(engine.lookup(1, "STARBUCKS INC").await.unwrap().rule_id, Some(legal));
    }

    #[tokio::test]
    async fn update_pattern_validates() {
        let store = Arc::new(MemoryStore::new());
        let engine = MerchantRuleEngine::new(store, RuleConfig::default());
        let id = engine
            .create_rule(NewMerchantRule::new(1, "Google").with_category("Ads"))
            .await
            .unwrap();
        assert!(engine.update_pattern(id, Some("(")).await.is_err());
        assert!(engine.update_pattern(id, Some("^google")).await.unwrap());
        assert!(engine.apply(1, "GOOGLE *ADS123").await.unwrap().matched);
    }

    #[tokio::test]
    async fn update_priority_reorders() {
        let store = Arc::new(MemoryStore::new());
        let engine = MerchantRuleEngine::new(store, RuleConfig::default());
        let a = engine
            .create_rule(NewMerchantRule::new(1, "A").with_pattern("shop").with_priority(5))
            .await
            .unwrap();
        let b = engine
            .create_rule(NewMerchantRule::new(1, "B").with_pattern("shop").with_priority(10))
            .await
            .unwrap();
        assert_eq!(engine.apply(1, "shopify").await.unwrap().rule_id, Some(b));
        engine.update_priority(a, 20).await.unwrap();
        assert_eq!(engine.apply(1, "shopify").await.unwrap().rule_id, Some(a));
    }
}
