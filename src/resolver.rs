//! C3: counterparty resolver. Extracts fiscal codes or scores token overlap
//! against the anagraphics cache to identify the counterparty behind a free
//! text bank transaction description.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::cache::anagraphics::tokenize;
use crate::cache::AnagraphicsCache;

static VAT_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{11}\b").unwrap());
static TAX_CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z]{6}\d{2}[A-Za-z]\d{2}[A-Za-z]\d{3}[A-Za-z]\b").unwrap());

const MIN_TOKEN_MATCH_SCORE: f64 = 0.3;

struct MemoEntry {
    result: Option<Uuid>,
    inserted_at: Instant,
}

/// Memoizes resolutions per description for a configurable window,
/// invalidated wholesale whenever the anagraphics cache refreshes (§4.3).
pub struct CounterpartyResolver {
    cache: Arc<AnagraphicsCache>,
    memo: DashMap<String, MemoEntry>,
    memo_ttl: Duration,
}

impl CounterpartyResolver {
    pub fn new(cache: Arc<AnagraphicsCache>, memo_ttl: Duration) -> Self {
        CounterpartyResolver {
            cache,
            memo: DashMap::new(),
            memo_ttl,
        }
    }

    /// Invalidates all memoized resolutions (call after a C2 refresh).
    pub fn invalidate(&self) {
        self.memo.clear();
    }

    /// Looks up a counterparty's denomination straight through the
    /// anagraphics cache, for callers that already hold the id (e.g. C4
    /// scoring a candidate pair) and don't need free-text resolution.
    pub async fn denomination(&self, counterparty_id: Uuid) -> Option<String> {
        self.cache.get(counterparty_id).await.map(|cp| cp.denomination)
    }

    pub async fn resolve(&self, description: &str) -> Option<Uuid> {
        if let Some(entry) = self.memo.get(description) {
            if entry.inserted_at.elapsed() < self.memo_ttl {
                return entry.result;
            }
        }

        let result = self.resolve_uncached(description).await;
        self.memo.insert(
            description.to_string(),
            MemoEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
        result
    }

    async fn resolve_uncached(&self, description: &str) -> Option<Uuid> {
        if let Some(id) = self.resolve_by_fiscal_code(description).await {
            return Some(id);
        }
        self.resolve_by_tokens(description).await
    }

    async fn resolve_by_fiscal_code(&self, description: &str) -> Option<Uuid> {
        for code in extract_fiscal_candidates(description) {
            if let Some(id) = self.cache.find_by_fiscal(&code).await {
                return Some(id);
            }
        }
        None
    }

    async fn resolve_by_tokens(&self, description: &str) -> Option<Uuid> {
        let desc_tokens = tokenize(description);
        if desc_tokens.is_empty() {
            return None;
        }

        let candidates = self.cache.search_by_tokens(&desc_tokens).await;
        let mut best: Option<(Uuid, f64)> = None;

        for candidate_id in candidates {
            let Some(candidate) = self.cache.get(candidate_id).await else {
                continue;
            };
            let candidate_tokens = tokenize(&candidate.denomination);
            if candidate_tokens.is_empty() {
                continue;
            }

            let intersection = desc_tokens.intersection(&candidate_tokens).count() as f64;
            let union = desc_tokens.union(&candidate_tokens).count() as f64;
            let jaccard = if union > 0.0 { intersection / union } else { 0.0 };
            let coverage = intersection / (candidate_tokens.len() as f64);

            let mut score = 0.4 * jaccard + 0.6 * coverage;
            if description.to_uppercase().contains(&candidate.denomination.to_uppercase()) {
                score = (score + 0.3).min(1.0);
            }

            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((candidate_id, score));
            }
        }

        best.filter(|(_, score)| *score >= MIN_TOKEN_MATCH_SCORE)
            .map(|(id, _)| id)
    }
}

fn extract_fiscal_candidates(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for m in VAT_PATTERN.find_iter(text) {
        out.push(m.as_str().to_string());
    }
    for m in TAX_CODE_PATTERN.find_iter(text) {
        out.push(m.as_str().to_uppercase());
    }
    out
}

/// Extracts candidate invoice numbers from free text (used by C4/C6),
/// grounded on `original_source/core/utils.py`'s `extract_invoice_number`:
/// tokens of 3-20 chars containing at least one digit, deduplicated and
/// capped to the 5 most specific (longest, most numeric) matches.
pub fn extract_invoice_numbers(text: &str) -> Vec<String> {
    static NUMBER_PATTERN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9/_.\-]{1,18}[A-Za-z0-9]").unwrap());

    let mut found: HashSet<String> = HashSet::new();
    for m in NUMBER_PATTERN.find_iter(text) {
        let cleaned = m
            .as_str()
            .trim_matches(|c: char| c == '.' || c == '-' || c == '/' || c == '_')
            .to_uppercase();
        if cleaned.len() >= 3 && cleaned.len() <= 20 && cleaned.chars().any(|c| c.is_ascii_digit()) {
            found.insert(cleaned);
        }
    }

    let mut result: Vec<String> = found.into_iter().collect();
    result.sort_by_key(|s| {
        let digit_count = s.chars().filter(|c| c.is_ascii_digit()).count();
        std::cmp::Reverse((s.len(), digit_count))
    });
    result.truncate(5);
    result
}
