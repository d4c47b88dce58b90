use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;
use tally_core::{days_between, normalize_text, MatchableTransaction, Money, ScoringConfig};

/// Per-component similarity in `[0.0, 1.0]` plus the rounded composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub amount: f64,
    pub description: f64,
    pub date: f64,
    pub score: u8,
}

/// Scores one document-sourced transaction against one manually keyed one.
/// Pure: identical inputs always produce the identical score.
#[derive(Debug, Clone)]
pub struct SimilarityScorer {
    config: ScoringConfig,
}

impl Default for SimilarityScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

impl SimilarityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn date_tolerance_days(&self) -> i64 {
        self.config.date_tolerance_days
    }

    /// The hard prefilter: only pairs inside the date window are scored.
    pub fn within_window(&self, a: NaiveDate, b: NaiveDate) -> bool {
        days_between(a, b) <= self.config.date_tolerance_days
    }

    /// `None` means "not a candidate".
    pub fn score(&self, document: &MatchableTransaction, manual: &MatchableTransaction) -> Option<u8> {
        self.breakdown(document, manual).map(|b| b.score)
    }

    pub fn breakdown(
        &self,
        document: &MatchableTransaction,
        manual: &MatchableTransaction,
    ) -> Option<ScoreBreakdown> {
        if !self.within_window(document.date, manual.date) {
            return None;
        }

        let amount = self.amount_score(document.amount, manual.amount);
        let description = self.description_score(&document.description, &manual.description);
        let date = self.date_score(days_between(document.date, manual.date));

        let c = &self.config;
        let composite =
            c.amount_weight * amount + c.description_weight * description + c.date_weight * date;
        let score = (composite * 100.0).round().clamp(0.0, 100.0) as u8;

        Some(ScoreBreakdown {
            amount,
            description,
            date,
            score,
        })
    }

    /// 1.0 on an exact match, a flat high score inside the near tolerance,
    /// then a linear decay that hits zero at the ceiling.
    pub fn amount_score(&self, a: Money, b: Money) -> f64 {
        if a == b {
            return 1.0;
        }
        let c = &self.config;
        let rel = a.relative_difference(b);
        if rel <= c.near_amount_tolerance {
            return c.near_amount_score;
        }
        if rel >= c.amount_ceiling {
            return 0.0;
        }
        let span = c.amount_ceiling - c.near_amount_tolerance;
        c.near_amount_score * (c.amount_ceiling - rel) / span
    }

    /// Token overlap mapped linearly, saturating at full credit.
    pub fn description_score(&self, a: &str, b: &str) -> f64 {
        let ratio = description_similarity(a, b);
        (ratio / self.config.description_saturation).min(1.0)
    }

    pub fn date_score(&self, days_apart: i64) -> f64 {
        let tolerance = self.config.date_tolerance_days;
        if days_apart > tolerance {
            return 0.0;
        }
        if tolerance == 0 {
            return 1.0;
        }
        1.0 - days_apart as f64 / tolerance as f64
    }
}

/// Jaccard ratio of the normalized word sets, in `[0.0, 1.0]`.
/// Two descriptions with no words at all share no evidence and score 0.
pub fn description_similarity(a: &str, b: &str) -> f64 {
    let left = token_set(a);
    let right = token_set(b);
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

fn token_set(s: &str) -> BTreeSet<String> {
    normalize_text(s)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::Source;

    fn tx(id: i64, source: Source, date: (i32, u32, u32), desc: &str, amount: &str) -> MatchableTransaction {
        MatchableTransaction {
            id,
            source,
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            amount: amount.parse().unwrap(),
            description: desc.to_string(),
            merchant: None,
            category: None,
            profile_type: None,
            notes: None,
            confidence: 0.0,
        }
    }

    fn doc(date: (i32, u32, u32), desc: &str, amount: &str) -> MatchableTransaction {
        tx(1, Source::Document, date, desc, amount)
    }

    fn manual(date: (i32, u32, u32), desc: &str, amount: &str) -> MatchableTransaction {
        tx(2, Source::Manual, date, desc, amount)
    }

    #[test]
    fn starbucks_receipt_matches_manual_entry() {
        let scorer = SimilarityScorer::default();
        let score = scorer
            .score(
                &doc((2024, 11, 1), "STARBUCKS #123", "50.00"),
                &manual((2024, 11, 1), "Starbucks Coffee", "50.00"),
            )
            .unwrap();
        assert!(score >= 90, "score was {score}");
    }

    #[test]
    fn outside_date_window_is_not_a_candidate() {
        let scorer = SimilarityScorer::default();
        let result = scorer.score(
            &doc((2024, 11, 1), "STARBUCKS", "50.00"),
            &manual((2024, 11, 6), "STARBUCKS", "50.00"),
        );
        assert_eq!(result, None);
    }

    #[test]
    fn boundary_day_is_scored_with_zero_date_credit() {
        let scorer = SimilarityScorer::default();
        let b = scorer
            .breakdown(
                &doc((2024, 11, 1), "STARBUCKS", "50.00"),
                &manual((2024, 11, 4), "STARBUCKS", "50.00"),
            )
            .unwrap();
        assert_eq!(b.date, 0.0);
        assert_eq!(b.score, 80);
    }

    #[test]
    fn scoring_is_deterministic() {
        let scorer = SimilarityScorer::default();
        let a = doc((2024, 3, 2), "AMAZON MKTPLACE PMTS", "23.17");
        let b = manual((2024, 3, 3), "amazon order", "23.71");
        let first = scorer.breakdown(&a, &b);
        for _ in 0..10 {
            assert_eq!(scorer.breakdown(&a, &b), first);
        }
    }

    #[test]
    fn amount_score_bands() {
        let scorer = SimilarityScorer::default();
        let m = |s: &str| s.parse::<Money>().unwrap();
        assert_eq!(scorer.amount_score(m("100.00"), m("100.00")), 1.0);
        assert_eq!(scorer.amount_score(m("100.00"), m("99.50")), 0.9);
        let mid = scorer.amount_score(m("100.00"), m("92.00"));
        assert!(mid > 0.0 && mid < 0.9, "mid was {mid}");
        assert_eq!(scorer.amount_score(m("100.00"), m("80.00")), 0.0);
        assert_eq!(scorer.amount_score(m("10.00"), m("-10.00")), 0.0);
    }

    #[test]
    fn amount_score_decreases_with_difference() {
        let scorer = SimilarityScorer::default();
        let m = |s: &str| s.parse::<Money>().unwrap();
        let near = scorer.amount_score(m("100.00"), m("97.00"));
        let far = scorer.amount_score(m("100.00"), m("90.00"));
        assert!(near > far);
    }

    #[test]
    fn description_similarity_identical() {
        assert_eq!(description_similarity("AMAZON", "amazon"), 1.0);
    }

    #[test]
    fn description_similarity_ignores_digits_and_punctuation() {
        assert_eq!(description_similarity("UBER *TRIP 4411", "uber trip"), 1.0);
    }

    #[test]
    fn description_similarity_completely_different() {
        assert_eq!(description_similarity("AMAZON", "STARBUCKS"), 0.0);
    }

    #[test]
    fn description_similarity_empty_is_zero() {
        assert_eq!(description_similarity("#123", ""), 0.0);
    }

    #[test]
    fn date_score_is_linear() {
        let scorer = SimilarityScorer::default();
        assert_eq!(scorer.date_score(0), 1.0);
        assert!((scorer.date_score(1) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(scorer.date_score(3), 0.0);
        assert_eq!(scorer.date_score(4), 0.0);
    }
}
