use std::cmp::Ordering;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use tally_core::{EngineConfig, MatchThresholds, MatchableTransaction};
use tracing::debug;

use crate::scorer::SimilarityScorer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchDecision {
    AutoMerge,
    NeedsReview,
    Pending,
    Discarded,
}

/// An accepted document/manual pairing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchPair {
    pub document: MatchableTransaction,
    pub manual: MatchableTransaction,
    pub score: u8,
    pub decision: MatchDecision,
}

impl MatchPair {
    pub fn staged_ids(&self) -> [i64; 2] {
        [self.document.id, self.manual.id]
    }

    pub fn contains(&self, staged_id: i64) -> bool {
        self.document.id == staged_id || self.manual.id == staged_id
    }
}

/// A scored pair that cleared the prefilter and the review threshold,
/// identified by positions in the input slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub document: usize,
    pub manual: usize,
    pub score: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchOutcome {
    /// Accepted pairs, highest score first.
    pub pairs: Vec<MatchPair>,
    pub document_only: Vec<MatchableTransaction>,
    pub manual_only: Vec<MatchableTransaction>,
}

/// Deterministic greedy assignment: best-scoring pairs claim their
/// transactions first. Not globally optimal.
#[derive(Debug, Clone)]
pub struct GreedyMatcher {
    scorer: SimilarityScorer,
    thresholds: MatchThresholds,
}

impl Default for GreedyMatcher {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl GreedyMatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            scorer: SimilarityScorer::new(config.scoring.clone()),
            thresholds: config.thresholds,
        }
    }

    pub fn scorer(&self) -> &SimilarityScorer {
        &self.scorer
    }

    /// `None` for scores below the review threshold: no pair is formed.
    pub fn classify(&self, score: u8) -> Option<MatchDecision> {
        if score >= self.thresholds.auto_merge {
            Some(MatchDecision::AutoMerge)
        } else if score >= self.thresholds.review {
            Some(MatchDecision::NeedsReview)
        } else {
            None
        }
    }

    /// Scores every temporally plausible pair. Manual transactions are
    /// indexed by date so each document only visits its tolerance window.
    pub fn candidates(
        &self,
        documents: &[MatchableTransaction],
        manuals: &[MatchableTransaction],
    ) -> Vec<Candidate> {
        let mut by_date: Vec<usize> = (0..manuals.len()).collect();
        by_date.sort_by_key(|&i| (manuals[i].date, manuals[i].id));

        let tolerance = Days::new(self.scorer.date_tolerance_days().max(0) as u64);
        let mut candidates = Vec::new();

        for (d_idx, doc) in documents.iter().enumerate() {
            let earliest = doc.date.checked_sub_days(tolerance).unwrap_or(NaiveDate::MIN);
            let latest = doc.date.checked_add_days(tolerance).unwrap_or(NaiveDate::MAX);
            let start = by_date.partition_point(|&i| manuals[i].date < earliest);

            for &m_idx in by_date[start..]
                .iter()
                .take_while(|&&i| manuals[i].date <= latest)
            {
                let Some(score) = self.scorer.score(doc, &manuals[m_idx]) else {
                    continue;
                };
                if score < self.thresholds.review {
                    continue;
                }
                candidates.push(Candidate {
                    document: d_idx,
                    manual: m_idx,
                    score,
                });
            }
        }

        candidates
    }

    pub fn run(
        &self,
        documents: Vec<MatchableTransaction>,
        manuals: Vec<MatchableTransaction>,
    ) -> MatchOutcome {
        let mut candidates = self.candidates(&documents, &manuals);
        candidates.sort_by(|a, b| compare_candidates(a, b, &documents, &manuals));

        let mut documents: Vec<Option<MatchableTransaction>> =
            documents.into_iter().map(Some).collect();
        let mut manuals: Vec<Option<MatchableTransaction>> =
            manuals.into_iter().map(Some).collect();

        let mut pairs = Vec::new();
        for candidate in candidates {
            if documents[candidate.document].is_none() || manuals[candidate.manual].is_none() {
                continue;
            }
            let Some(decision) = self.classify(candidate.score) else {
                continue;
            };
            if let (Some(document), Some(manual)) = (
                documents[candidate.document].take(),
                manuals[candidate.manual].take(),
            ) {
                debug!(
                    document_id = document.id,
                    manual_id = manual.id,
                    score = candidate.score,
                    ?decision,
                    "accepted match pair"
                );
                pairs.push(MatchPair {
                    document,
                    manual,
                    score: candidate.score,
                    decision,
                });
            }
        }

        MatchOutcome {
            pairs,
            document_only: documents.into_iter().flatten().collect(),
            manual_only: manuals.into_iter().flatten().collect(),
        }
    }
}

/// Score descending, then document id, then manual id.
fn compare_candidates(
    a: &Candidate,
    b: &Candidate,
    documents: &[MatchableTransaction],
    manuals: &[MatchableTransaction],
) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| documents[a.document].id.cmp(&documents[b.document].id))
        .then_with(|| manuals[a.manual].id.cmp(&manuals[b.manual].id))
}
