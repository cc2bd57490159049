//! C4: match analyzer — weighted multi-signal scoring of a single
//! (invoice, transaction) pair. Never raises: a pair that can't be scored
//! well just gets a low score (§4.6's "C4/C5/C6 never raise outward").

use chrono::NaiveDate;
use rust_decimal::prelude::*;

use crate::models::{ConfidenceBand, EPSILON};

/// Everything the analyzer needs about one candidate pair — deliberately
/// flat rather than the full `Invoice`/`BankTransaction` types so it can be
/// constructed from either a 1:1 candidate or a leg of an N:M combination.
#[derive(Debug, Clone)]
pub struct PairFeatures {
    pub target_amount: Decimal,
    pub candidate_amount: Decimal,
    pub transaction_description: String,
    pub extracted_invoice_numbers: Vec<String>,
    pub transaction_date: NaiveDate,
    pub candidate_doc_number: String,
    pub candidate_doc_date: NaiveDate,
    pub candidate_denomination: String,
}

#[derive(Debug, Clone, Default)]
pub struct SignalBreakdown {
    pub amount: f64,
    pub invoice_number: f64,
    pub name: f64,
    pub temporal: f64,
    pub pattern: f64,
}

#[derive(Debug, Clone)]
pub struct ScoreResult {
    pub score: f64,
    pub band: ConfidenceBand,
    pub reasons: Vec<String>,
    pub signal_breakdown: SignalBreakdown,
}

/// A pluggable scorer capability (§9 design note): takes the same features
/// and returns a score adjustment. The deterministic analyzer below is the
/// only scorer wired into C6 by default.
pub type Scorer = dyn Fn(&PairFeatures) -> f64 + Send + Sync;

pub fn analyze(features: &PairFeatures, min_confidence: f64, high_confidence: f64) -> ScoreResult {
    let mut reasons = Vec::new();
    let mut breakdown = SignalBreakdown::default();

    breakdown.amount = score_amount(features, &mut reasons);
    breakdown.invoice_number = score_invoice_number(features, &mut reasons);
    breakdown.name = score_name(features, &mut reasons);
    breakdown.temporal = score_temporal(features, &mut reasons);
    breakdown.pattern = score_pattern(features, &mut reasons);

    let total = (breakdown.amount
        + breakdown.invoice_number
        + breakdown.name
        + breakdown.temporal
        + breakdown.pattern)
        .min(1.0);

    let band = ConfidenceBand::from_score(total, min_confidence, high_confidence);

    ScoreResult {
        score: total,
        band,
        reasons,
        signal_breakdown: breakdown,
    }
}

fn score_amount(f: &PairFeatures, reasons: &mut Vec<String>) -> f64 {
    let diff = (f.target_amount - f.candidate_amount).abs();
    if diff <= EPSILON {
        reasons.push("amount_exact".to_string());
        return 0.6;
    }

    if f.target_amount.is_zero() {
        return 0.0;
    }
    let relative = (diff / f.target_amount.abs())
        .to_f64()
        .unwrap_or(f64::MAX);
    let eps_relative = (EPSILON / f.target_amount.abs()).to_f64().unwrap_or(0.0);

    if relative > eps_relative && relative <= 0.02 {
        reasons.push("amount_similar".to_string());
        0.4 * (1.0 - relative / 0.02)
    } else {
        0.0
    }
}

fn score_invoice_number(f: &PairFeatures, reasons: &mut Vec<String>) -> f64 {
    let candidate_norm = normalize_token(&f.candidate_doc_number);
    if candidate_norm.is_empty() {
        return 0.0;
    }

    let best_similarity = f
        .extracted_invoice_numbers
        .iter()
        .map(|n| token_similarity(&candidate_norm, &normalize_token(n)))
        .fold(0.0_f64, f64::max);

    if best_similarity >= 0.9 {
        reasons.push("invoice_number_match".to_string());
        0.3 * best_similarity
    } else {
        0.0
    }
}

fn score_name(f: &PairFeatures, reasons: &mut Vec<String>) -> f64 {
    let denomination = f.candidate_denomination.trim();
    if denomination.is_empty() {
        return 0.0;
    }
    let desc_upper = f.transaction_description.to_uppercase();
    let denom_upper = denomination.to_uppercase();

    let desc_tokens = crate::cache::anagraphics::tokenize(&f.transaction_description);
    let denom_tokens = crate::cache::anagraphics::tokenize(denomination);
    if denom_tokens.is_empty() {
        return 0.0;
    }
    let coverage = (desc_tokens.intersection(&denom_tokens).count() as f64
        / denom_tokens.len() as f64)
        .min(1.0);

    if desc_upper.contains(&denom_upper) {
        reasons.push("name_exact".to_string());
        return 0.25 * (0.7 + 0.3 * coverage);
    }

    let intersection = desc_tokens.intersection(&denom_tokens).count() as f64;
    let union = desc_tokens.union(&denom_tokens).count() as f64;
    if intersection == 0.0 || union == 0.0 {
        return 0.0;
    }
    let word_coverage = intersection / union;
    let desc_coverage = if desc_tokens.is_empty() {
        0.0
    } else {
        intersection / desc_tokens.len() as f64
    };
    let avg_token_len = if denom_tokens.is_empty() {
        0.0
    } else {
        denom_tokens.iter().map(|t| t.len()).sum::<usize>() as f64 / denom_tokens.len() as f64
    };
    let specificity = (avg_token_len / 6.0).min(1.2);

    if word_coverage > 0.0 {
        reasons.push("name_partial".to_string());
    }
    0.15 * word_coverage * (0.7 + 0.3 * desc_coverage) * specificity
}

fn score_temporal(f: &PairFeatures, reasons: &mut Vec<String>) -> f64 {
    let days = (f.transaction_date - f.candidate_doc_date).num_days().abs() as f64;
    let decay = if days <= 30.0 {
        1.0 - days / 30.0
    } else if days <= 90.0 {
        (-((days - 30.0) / 30.0)).exp()
    } else {
        0.0
    };
    if decay > 0.0 {
        reasons.push("temporal_proximity".to_string());
    }
    0.10 * decay
}

fn score_pattern(f: &PairFeatures, reasons: &mut Vec<String>) -> f64 {
    let mut bonus = 0.0;
    let desc_upper = f.transaction_description.to_uppercase();

    let keywords = ["BONIFICO", "PAGAMENTO", "RIFERIMENTO", "FATTURA", "SALDO"];
    let keyword_hits = keywords.iter().filter(|k| desc_upper.contains(**k)).count();
    if keyword_hits > 0 {
        bonus += 0.05 * (keyword_hits as f64 / keywords.len() as f64);
    }

    let candidate_digits: String = f.candidate_doc_number.chars().filter(|c| c.is_ascii_digit()).collect();
    if !candidate_digits.is_empty() && desc_upper.contains(&candidate_digits) {
        bonus += 0.05;
    }

    let bonus = bonus.min(0.10);
    if bonus > 0.0 {
        reasons.push("pattern_bonus".to_string());
    }
    bonus
}

fn normalize_token(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Simple bounded-edit-distance similarity ratio in [0, 1]: 1.0 for exact
/// match, decaying with Levenshtein distance relative to the longer string.
fn token_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let distance = levenshtein(a, b) as f64;
    let max_len = a.len().max(b.len()) as f64;
    (1.0 - distance / max_len).max(0.0)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for i in 1..=a.len() {
        let mut prev_diag = row[0];
        row[0] = i;
        for j in 1..=b.len() {
            let temp = row[j];
            row[j] = if a[i - 1] == b[j - 1] {
                prev_diag
            } else {
                1 + row[j].min(row[j - 1]).min(prev_diag)
            };
            prev_diag = temp;
        }
    }
    row[b.len()]
}
