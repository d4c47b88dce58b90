//! Session reconciliation: bucket staged document and manual records,
//! then commit the accepted view into the ledger.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tally_core::{
    provenance_key, EngineConfig, MatchableTransaction, NewTransaction, SessionKey, Source,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::intelligence::Enrich;
use crate::matcher::{GreedyMatcher, MatchDecision, MatchPair};
use crate::store::{InsertOutcome, LedgerStore, StagingStore, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Reconciliation session not found: {0}")]
    SessionNotFound(SessionKey),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A staged row that failed validation and was left out of matching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
    pub id: i64,
    pub source: Source,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub document_count: usize,
    pub manual_count: usize,
    pub auto_merged: usize,
    pub needs_review: usize,
    pub document_only: usize,
    pub manual_only: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileResult {
    pub session: SessionKey,
    pub summary: ReconcileSummary,
    pub auto_merged: Vec<MatchPair>,
    pub needs_review: Vec<MatchPair>,
    pub document_only: Vec<MatchableTransaction>,
    pub manual_only: Vec<MatchableTransaction>,
    pub rejected: Vec<RejectedRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewAction {
    Keep,
    Discard,
    /// Commit both members of a pair as independent records.
    Separate,
}

/// `id` is the staged id of either pair member or of a leftover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub id: i64,
    pub decision: ReviewAction,
}

impl ReviewDecision {
    pub fn new(id: i64, decision: ReviewAction) -> Self {
        ReviewDecision { id, decision }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Committed { transaction_id: i64 },
    /// Same provenance was committed by an earlier call.
    AlreadyCommitted { transaction_id: i64 },
    Discarded,
    /// Review pair without a decision; left for a later commit.
    Pending,
    NotFound,
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitItem {
    pub staged_ids: Vec<i64>,
    /// Final pair decision; `None` for leftovers and unknown ids.
    pub decision: Option<MatchDecision>,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitReport {
    /// Records newly written by this call.
    pub committed_count: usize,
    pub items: Vec<CommitItem>,
}

impl CommitReport {
    fn push(&mut self, staged_ids: Vec<i64>, decision: Option<MatchDecision>, outcome: ItemOutcome) {
        if matches!(outcome, ItemOutcome::Committed { .. }) {
            self.committed_count += 1;
        }
        self.items.push(CommitItem {
            staged_ids,
            decision,
            outcome,
        });
    }
}

#[derive(Default)]
struct Staged {
    documents: Vec<MatchableTransaction>,
    manuals: Vec<MatchableTransaction>,
    rejected: Vec<RejectedRecord>,
    /// Staged id to the ledger record it already went into.
    committed: HashMap<i64, i64>,
}

pub struct Reconciler<S> {
    store: Arc<S>,
    matcher: GreedyMatcher,
    enricher: Option<Arc<dyn Enrich>>,
}

impl<S: StagingStore + LedgerStore> Reconciler<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        Reconciler {
            store,
            matcher: GreedyMatcher::new(config),
            enricher: None,
        }
    }

    /// Runs `enricher` on every record before its first insert, and lets it
    /// learn from the record once that insert has won.
    pub fn with_enricher(mut self, enricher: Arc<dyn Enrich>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn matcher(&self) -> &GreedyMatcher {
        &self.matcher
    }

    /// Buckets the session without writing anything.
    pub async fn reconcile(&self, session: &SessionKey) -> Result<ReconcileResult, ReconcileError> {
        let staged = self.load(session).await?;
        let document_count = staged.documents.len();
        let manual_count = staged.manuals.len();
        let outcome = self.matcher.run(staged.documents, staged.manuals);

        let (auto_merged, needs_review): (Vec<MatchPair>, Vec<MatchPair>) = outcome
            .pairs
            .into_iter()
            .partition(|p| p.decision == MatchDecision::AutoMerge);

        let summary = ReconcileSummary {
            document_count,
            manual_count,
            auto_merged: auto_merged.len(),
            needs_review: needs_review.len(),
            document_only: outcome.document_only.len(),
            manual_only: outcome.manual_only.len(),
            rejected: staged.rejected.len(),
        };
        info!(
            session = %session,
            documents = document_count,
            manuals = manual_count,
            auto_merged = summary.auto_merged,
            needs_review = summary.needs_review,
            rejected = summary.rejected,
            "Reconciled session"
        );

        Ok(ReconcileResult {
            session: session.clone(),
            summary,
            auto_merged,
            needs_review,
            document_only: outcome.document_only,
            manual_only: outcome.manual_only,
            rejected: staged.rejected,
        })
    }

    /// Writes the accepted view of the session. Safe to repeat: a pair or
    /// leftover touching a staged row that is already in the ledger is
    /// reported as committed and never written again.
    pub async fn commit(
        &self,
        session: &SessionKey,
        decisions: &[ReviewDecision],
    ) -> Result<CommitReport, ReconcileError> {
        let Staged {
            documents,
            manuals,
            rejected,
            committed,
        } = self.load(session).await?;
        let outcome = self.matcher.run(documents, manuals);

        let actions: HashMap<i64, ReviewAction> =
            decisions.iter().map(|d| (d.id, d.decision)).collect();
        let mut known: HashSet<i64> = HashSet::new();
        let mut report = CommitReport::default();

        for pair in &outcome.pairs {
            let ids = pair.staged_ids();
            known.extend(ids);
            let action = ids.iter().find_map(|id| actions.get(id).copied());

            if action == Some(ReviewAction::Separate) {
                for tx in [&pair.document, &pair.manual] {
                    let prior = committed.get(&tx.id).copied();
                    let result = self
                        .commit_group(session, &[tx.id], single_record(session, tx), prior)
                        .await?;
                    report.push(vec![tx.id], Some(pair.decision), result);
                }
                continue;
            }

            let prior = ids.iter().find_map(|id| committed.get(id).copied());
            let kept = !matches!(
                (pair.decision, action),
                (_, Some(ReviewAction::Discard)) | (MatchDecision::NeedsReview, None)
            );
            match (kept, prior) {
                (true, _) => {
                    let result = self
                        .commit_group(session, &ids, merged_record(session, pair), prior)
                        .await?;
                    report.push(ids.to_vec(), Some(pair.decision), result);
                }
                (false, Some(transaction_id)) => report.push(
                    ids.to_vec(),
                    Some(pair.decision),
                    ItemOutcome::AlreadyCommitted { transaction_id },
                ),
                (false, None) if action == Some(ReviewAction::Discard) => {
                    report.push(ids.to_vec(), Some(MatchDecision::Discarded), ItemOutcome::Discarded)
                }
                (false, None) => {
                    report.push(ids.to_vec(), Some(MatchDecision::Pending), ItemOutcome::Pending)
                }
            }
        }

        for tx in outcome.document_only.iter().chain(&outcome.manual_only) {
            known.insert(tx.id);
            let result = match (committed.get(&tx.id), actions.get(&tx.id)) {
                (Some(&transaction_id), _) => ItemOutcome::AlreadyCommitted { transaction_id },
                (None, Some(ReviewAction::Discard)) => ItemOutcome::Discarded,
                (None, _) => {
                    self.commit_group(session, &[tx.id], single_record(session, tx), None)
                        .await?
                }
            };
            report.push(vec![tx.id], None, result);
        }

        for rejected in rejected {
            known.insert(rejected.id);
            report.push(
                vec![rejected.id],
                None,
                ItemOutcome::Invalid {
                    reason: rejected.reason,
                },
            );
        }

        for decision in decisions {
            if known.insert(decision.id) {
                warn!(session = %session, staged_id = decision.id, "Review decision for unknown record");
                report.push(vec![decision.id], None, ItemOutcome::NotFound);
            }
        }

        info!(
            session = %session,
            committed = report.committed_count,
            items = report.items.len(),
            "Committed session"
        );
        Ok(report)
    }

    /// Drops the session and its staged rows. Returns the rows removed.
    pub async fn clear(&self, session: &SessionKey) -> Result<u64, ReconcileError> {
        if !self.store.session_exists(session).await? {
            return Err(ReconcileError::SessionNotFound(session.clone()));
        }
        let removed = self.store.clear_session(session).await?;
        info!(session = %session, removed, "Cleared session");
        Ok(removed)
    }

    async fn load(&self, session: &SessionKey) -> Result<Staged, ReconcileError> {
        if !self.store.session_exists(session).await? {
            return Err(ReconcileError::SessionNotFound(session.clone()));
        }

        let mut staged = Staged::default();
        for source in [Source::Document, Source::Manual] {
            for row in self.store.staged_transactions(session, source).await? {
                if let Some(transaction_id) = row.committed_as {
                    staged.committed.insert(row.id, transaction_id);
                }
                match MatchableTransaction::validate(row) {
                    Ok(tx) if source == Source::Document => staged.documents.push(tx),
                    Ok(tx) => staged.manuals.push(tx),
                    Err(e) => {
                        warn!(session = %session, staged_id = e.staged_id(), "{e}");
                        staged.rejected.push(RejectedRecord {
                            id: e.staged_id(),
                            source,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(staged)
    }

    /// Commits `tx` for `staged_ids`. Enrichment runs only for a record
    /// not yet in the ledger, and learning only once the insert won.
    async fn commit_group(
        &self,
        session: &SessionKey,
        staged_ids: &[i64],
        mut tx: NewTransaction,
        prior: Option<i64>,
    ) -> Result<ItemOutcome, StoreError> {
        let prior = match prior {
            Some(id) => Some(id),
            None => {
                self.store
                    .find_by_provenance(tx.user_id, &tx.provenance_key)
                    .await?
            }
        };
        let enricher = self.enricher.as_ref().filter(|_| prior.is_none());

        if let Some(enricher) = enricher {
            let mut enriched = tx.clone();
            match enricher.enrich(&mut enriched).await {
                Ok(()) => tx = enriched,
                Err(e) => warn!(provenance = %tx.provenance_key, "Enrichment failed: {e}"),
            }
        }

        match self.store.commit_staged(session, staged_ids, &tx).await? {
            InsertOutcome::Inserted(transaction_id) => {
                if let Some(enricher) = enricher {
                    if let Err(e) = enricher.learn(transaction_id, &tx).await {
                        warn!(transaction_id, "Learning from committed record failed: {e}");
                    }
                }
                Ok(ItemOutcome::Committed { transaction_id })
            }
            InsertOutcome::Existing(transaction_id) => {
                Ok(ItemOutcome::AlreadyCommitted { transaction_id })
            }
        }
    }
}

/// Canonical record for a kept pair: the document's date, amount and
/// description; annotations from the document when present.
fn merged_record(session: &SessionKey, pair: &MatchPair) -> NewTransaction {
    let (doc, manual) = (&pair.document, &pair.manual);
    NewTransaction {
        user_id: session.user_id,
        date: doc.date,
        amount: doc.amount,
        description: doc.description.clone(),
        merchant: doc.merchant.clone().or_else(|| manual.merchant.clone()),
        category: doc.category.clone().or_else(|| manual.category.clone()),
        profile_type: doc
            .profile_type
            .clone()
            .or_else(|| manual.profile_type.clone()),
        notes: doc.notes.clone().or_else(|| manual.notes.clone()),
        confidence: doc.confidence.max(manual.confidence),
        is_recurring: false,
        provenance_key: provenance_key(session, &pair.staged_ids()),
    }
}

fn single_record(session: &SessionKey, tx: &MatchableTransaction) -> NewTransaction {
    NewTransaction {
        user_id: session.user_id,
        date: tx.date,
        amount: tx.amount,
        description: tx.description.clone(),
        merchant: tx.merchant.clone(),
        category: tx.category.clone(),
        profile_type: tx.profile_type.clone(),
        notes: tx.notes.clone(),
        confidence: tx.confidence,
        is_recurring: false,
        provenance_key: provenance_key(session, &[tx.id]),
    }
}
