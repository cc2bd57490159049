//! C6: suggestion engine — orchestrates C3 (resolver), C5 (combination
//! generator) and C4 (analyzer) into ranked 1:1 and N:M suggestions.
//! Grounded on the teacher's `orchestrator.rs`: a thin coordinator that
//! never itself propagates failures from the subsystems it drives (§4.6
//! "the engine returns an empty list rather than propagating").

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::analyzer::{analyze, PairFeatures};
use crate::combination::{generate_combinations, SearchBudget};
use crate::config::{MatchConfig, SearchConfig};
use crate::errors::Result;
use crate::models::{BankTransaction, ConfidenceBand, Direction, Invoice, EPSILON};
use crate::pattern::PatternStore;
use crate::resolver::{extract_invoice_numbers, CounterpartyResolver};

/// Supplies the candidate invoice pools C6 needs, independent of whatever
/// persistence layer implements it.
#[async_trait]
pub trait InvoiceCandidateSource: Send + Sync {
    /// Up to `limit` candidates matching direction/status/counterparty,
    /// ordered by `|residual - target|` ascending.
    async fn candidates_near_residual(
        &self,
        direction: Direction,
        target: Decimal,
        counterparty_filter: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Invoice>>;

    /// Candidates whose residual falls in `(low, high]`, for a specific
    /// counterparty, ordered by closeness to `target`.
    async fn candidates_in_range(
        &self,
        direction: Direction,
        low: Decimal,
        high: Decimal,
        counterparty_id: Uuid,
        target: Decimal,
        limit: usize,
    ) -> Result<Vec<Invoice>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    OneToOne,
    NToM,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub invoice_ids: Vec<Uuid>,
    pub transaction_ids: Vec<Uuid>,
    pub proposed_amount: Decimal,
    pub confidence_band: ConfidenceBand,
    pub confidence_score: f64,
    pub reasons: Vec<String>,
    pub match_type: MatchType,
}

pub struct SuggestionEngine {
    candidates: Arc<dyn InvoiceCandidateSource>,
    resolver: Arc<CounterpartyResolver>,
    patterns: Arc<PatternStore>,
    matching: MatchConfig,
    search: SearchConfig,
    workers: usize,
}

impl SuggestionEngine {
    pub fn new(
        candidates: Arc<dyn InvoiceCandidateSource>,
        resolver: Arc<CounterpartyResolver>,
        patterns: Arc<PatternStore>,
        matching: MatchConfig,
        search: SearchConfig,
        workers: usize,
    ) -> Self {
        SuggestionEngine {
            candidates,
            resolver,
            patterns,
            matching,
            search,
            workers,
        }
    }

    /// §4.6 1:1 pipeline. Never returns an error: on any internal failure
    /// it logs and falls back to an empty suggestion list.
    pub async fn suggest_1_to_1(
        &self,
        transaction: &BankTransaction,
        counterparty_filter: Option<Uuid>,
    ) -> Vec<Suggestion> {
        let target = transaction.residual().abs();
        if target <= EPSILON / Decimal::from(2) {
            return Vec::new();
        }
        let direction = transaction.direction_for_match();

        let filter = match counterparty_filter {
            Some(id) => Some(id),
            None => self.resolver.resolve(&transaction.description).await,
        };

        let invoices = match self
            .candidates
            .candidates_near_residual(direction, target, filter, 50)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("suggest_1_to_1: candidate lookup failed: {}", e);
                return Vec::new();
            }
        };

        let extracted_numbers = extract_invoice_numbers(&transaction.description);
        let mut scored: Vec<Suggestion> = Vec::new();

        for invoice in &invoices {
            let candidate_denomination = self
                .resolver
                .denomination(invoice.counterparty_id)
                .await
                .unwrap_or_default();
            let features = PairFeatures {
                target_amount: target,
                candidate_amount: invoice.residual().abs(),
                transaction_description: transaction.description.clone(),
                extracted_invoice_numbers: extracted_numbers.clone(),
                transaction_date: transaction.transaction_date,
                candidate_doc_number: invoice.doc_number.clone(),
                candidate_doc_date: invoice.doc_date,
                candidate_denomination,
            };
            let result = analyze(&features, self.matching.min_confidence, self.matching.high_confidence);
            if result.band == ConfidenceBand::VeryLow {
                continue;
            }
            scored.push(Suggestion {
                invoice_ids: vec![invoice.id],
                transaction_ids: vec![transaction.id],
                proposed_amount: invoice.residual().abs().min(target),
                confidence_band: result.band,
                confidence_score: result.score,
                reasons: result.reasons,
                match_type: MatchType::OneToOne,
            });
        }

        scored.sort_by(|a, b| {
            b.confidence_band
                .rank()
                .cmp(&a.confidence_band.rank())
                .then(b.confidence_score.partial_cmp(&a.confidence_score).unwrap_or(std::cmp::Ordering::Equal))
        });
        scored
    }

    /// §4.6 N:M pipeline. Requires a counterparty filter by design — an
    /// absent filter returns an empty set rather than searching unbounded.
    pub async fn suggest_n_to_m(
        &self,
        transaction: &BankTransaction,
        counterparty_filter: Option<Uuid>,
    ) -> Vec<Suggestion> {
        let Some(counterparty_id) = counterparty_filter else {
            return Vec::new();
        };
        let target = transaction.residual().abs();
        if target <= EPSILON / Decimal::from(2) {
            return Vec::new();
        }
        let direction = transaction.direction_for_match();

        let low = EPSILON / Decimal::from(2);
        let high = target * Decimal::new(15, 1); // 1.5 * target

        let invoices = match self
            .candidates
            .candidates_in_range(direction, low, high, counterparty_id, target, 100)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("suggest_n_to_m: candidate lookup failed: {}", e);
                return Vec::new();
            }
        };
        if invoices.is_empty() {
            return Vec::new();
        }

        let pool: Vec<(Uuid, Decimal)> = invoices.iter().map(|i| (i.id, i.residual().abs())).collect();
        let budget = SearchBudget {
            max_wallclock: std::time::Duration::from_millis(self.search.max_wallclock_ms),
            max_iterations_per_size: 200_000,
        };
        let combinations = generate_combinations(&pool, target, self.search.max_combination_size, self.workers, budget);

        let by_id: std::collections::HashMap<Uuid, &Invoice> = invoices.iter().map(|i| (i.id, i)).collect();
        let pattern = self.patterns.get(counterparty_id);

        let mut suggestions: Vec<Suggestion> = Vec::new();
        for combo in &combinations {
            let members: Vec<&Invoice> = combo
                .invoice_ids
                .iter()
                .filter_map(|id| by_id.get(id).copied())
                .collect();
            if members.len() != combo.invoice_ids.len() {
                continue;
            }

            let diff_ratio = ((combo.sum - target).abs() / target).to_f64().unwrap_or(1.0);
            let temporal_coherence = temporal_coherence(&members);
            let numeric_bonus = numeric_sequence_bonus(&members);
            let size_penalty = 0.05 * (members.len().saturating_sub(3)) as f64;

            let mut confidence = 0.6 + 0.25 * (1.0 - diff_ratio).max(0.0) + 0.1 * temporal_coherence
                + 0.1 * numeric_bonus
                - size_penalty;

            let mut reasons = vec!["combination_match".to_string()];
            if let Some(p) = &pattern {
                let adjustment = (p.overall_confidence - 0.5) * 0.2;
                confidence += adjustment;
                reasons.push("pattern_adjusted".to_string());
            }
            confidence = confidence.clamp(0.0, 1.0);

            let band = ConfidenceBand::from_score(confidence, self.matching.min_confidence, self.matching.high_confidence);
            if band == ConfidenceBand::VeryLow {
                continue;
            }

            suggestions.push(Suggestion {
                invoice_ids: combo.invoice_ids.clone(),
                transaction_ids: vec![transaction.id],
                proposed_amount: combo.sum.min(target),
                confidence_band: band,
                confidence_score: confidence,
                reasons,
                match_type: MatchType::NToM,
            });
        }

        dedupe_suggestions(suggestions)
    }
}

fn temporal_coherence(members: &[&Invoice]) -> f64 {
    let dates: Vec<NaiveDate> = members.iter().map(|i| i.doc_date).collect();
    let Some(min) = dates.iter().min() else { return 0.0 };
    let Some(max) = dates.iter().max() else { return 0.0 };
    let days = (*max - *min).num_days() as f64;
    (1.0 - days / 60.0).max(0.0)
}

fn numeric_sequence_bonus(members: &[&Invoice]) -> f64 {
    let mut trailing: Vec<i64> = members
        .iter()
        .filter_map(|i| {
            i.doc_number
                .chars()
                .rev()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .chars()
                .rev()
                .collect::<String>()
                .parse::<i64>()
                .ok()
        })
        .collect();
    if trailing.len() < 2 {
        return 0.0;
    }
    trailing.sort();
    let mut consecutive = 0;
    for window in trailing.windows(2) {
        if window[1] == window[0] + 1 {
            consecutive += 1;
        }
    }
    consecutive as f64 / (trailing.len() - 1) as f64
}

/// §4.6 step 6: dedup by sorted invoice-id set; group near-duplicates by
/// proposed amount and large id overlap, keep the highest-scoring
/// representative of each group.
fn dedupe_suggestions(mut suggestions: Vec<Suggestion>) -> Vec<Suggestion> {
    suggestions.sort_by(|a, b| b.confidence_score.partial_cmp(&a.confidence_score).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<Suggestion> = Vec::new();
    let mut seen_exact: HashSet<Vec<Uuid>> = HashSet::new();

    for s in suggestions {
        let mut ids = s.invoice_ids.clone();
        ids.sort();
        if !seen_exact.insert(ids.clone()) {
            continue;
        }

        let is_near_duplicate = kept.iter().any(|existing| {
            let amount_close = (existing.proposed_amount - s.proposed_amount).abs() <= EPSILON;
            let existing_set: HashSet<Uuid> = existing.invoice_ids.iter().copied().collect();
            let candidate_set: HashSet<Uuid> = ids.iter().copied().collect();
            let overlap = existing_set.intersection(&candidate_set).count();
            let smaller = existing_set.len().min(candidate_set.len()).max(1);
            amount_close && (overlap as f64 / smaller as f64) >= 0.5
        });

        if !is_near_duplicate {
            kept.push(s);
        }
    }

    kept.sort_by(|a, b| {
        b.confidence_band
            .rank()
            .cmp(&a.confidence_band.rank())
            .then(b.confidence_score.partial_cmp(&a.confidence_score).unwrap_or(std::cmp::Ordering::Equal))
    });
    kept
}
