//! C7: client-pattern learner. A lazy, per-counterparty model over
//! historical reconciled payments, trained in the background so C6 never
//! blocks on first touch (§4.7). Grounded on
//! `original_source/core/smart_client_reconciliation.py`'s per-client model
//! shape (amount clusters + temporal distribution + sequence stats) and the
//! teacher's `window/scheduler.rs` dispatch-and-forget worker style.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::*;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PatternConfig;
use crate::errors::Result;
use crate::models::{ClientPattern, PatternPrediction};

/// One historical reconciled payment, the unit C7 trains on.
#[derive(Debug, Clone)]
pub struct HistoricalPayment {
    pub invoice_date: NaiveDate,
    pub payment_date: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub related_doc_numbers: Vec<String>,
}

/// Supplies trailing history for a counterparty. Window (3 years, 5,000 row
/// cap) is the source's responsibility, not the learner's.
#[async_trait]
pub trait PaymentHistorySource: Send + Sync {
    async fn historical_payments(&self, counterparty_id: Uuid) -> Result<Vec<HistoricalPayment>>;
}

struct CacheEntry {
    prediction: PatternPrediction,
    pattern: Arc<ClientPattern>,
    trained_at: Instant,
    training_in_flight: bool,
    last_access: Instant,
}

/// LRU-by-access, TTL-expiring store of trained patterns. The per-pattern
/// "single reentrant lock" from §4.7 is the outer `RwLock` here — simpler
/// than the teacher's per-key lock table since training replaces one entry
/// atomically rather than mutating it in place. Bounded by `config.max_size`,
/// evicted by least-recent-access once over the cap (§4.7 "caches refuse to
/// grow past their configured caps"), mirroring `cache/anagraphics.rs`'s
/// `evict_if_oversized`.
pub struct PatternStore {
    source: RwLock<Option<Arc<dyn PaymentHistorySource>>>,
    config: PatternConfig,
    cache: RwLock<HashMap<Uuid, CacheEntry>>,
}

impl PatternStore {
    pub fn new(config: PatternConfig) -> Self {
        PatternStore {
            source: RwLock::new(None),
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_source(config: PatternConfig, source: Arc<dyn PaymentHistorySource>) -> Self {
        PatternStore {
            source: RwLock::new(Some(source)),
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Wires a history source after construction, for façades that build
    /// the repository only once the pool is available.
    pub fn set_source(&self, source: Arc<dyn PaymentHistorySource>) {
        *self.source.write() = Some(source);
    }

    /// Returns the last trained prediction for `counterparty_id`, or `None`
    /// if no pattern has been trained yet (or it's stale and a background
    /// retrain has just been kicked off). Never blocks on training.
    pub fn get(self: &Arc<Self>, counterparty_id: Uuid) -> Option<PatternPrediction> {
        self.touch(counterparty_id);

        let fresh = {
            let cache = self.cache.read();
            cache.get(&counterparty_id).and_then(|entry| {
                if entry.trained_at.elapsed() < Duration::from_secs(self.config.ttl_hours * 3600) {
                    Some(entry.prediction)
                } else {
                    None
                }
            })
        };
        if fresh.is_some() {
            return fresh;
        }

        self.maybe_spawn_training(counterparty_id);

        // Serve a stale prediction while retraining happens in the
        // background, rather than treating "stale" the same as "absent".
        self.cache.read().get(&counterparty_id).map(|e| e.prediction)
    }

    pub fn pattern(&self, counterparty_id: Uuid) -> Option<Arc<ClientPattern>> {
        self.touch(counterparty_id);
        self.cache.read().get(&counterparty_id).map(|e| e.pattern.clone())
    }

    fn touch(&self, counterparty_id: Uuid) {
        if let Some(entry) = self.cache.write().get_mut(&counterparty_id) {
            entry.last_access = Instant::now();
        }
    }

    /// Invalidates a single counterparty's pattern (§4.7 "invalidated
    /// incrementally when links change").
    pub fn invalidate(&self, counterparty_id: Uuid) {
        self.cache.write().remove(&counterparty_id);
    }

    fn maybe_spawn_training(self: &Arc<Self>, counterparty_id: Uuid) {
        {
            let mut cache = self.cache.write();
            if let Some(entry) = cache.get_mut(&counterparty_id) {
                if entry.training_in_flight {
                    return;
                }
                entry.training_in_flight = true;
            }
        }

        let Some(source) = self.source.read().clone() else {
            return;
        };
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let history = match source.historical_payments(counterparty_id).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("pattern training: history fetch failed for {}: {}", counterparty_id, e);
                    store.clear_in_flight(counterparty_id);
                    return;
                }
            };

            if history.len() < store.config.min_records {
                store.clear_in_flight(counterparty_id);
                return;
            }

            let (pattern, prediction) = train(counterparty_id, &history);
            let mut cache = store.cache.write();
            cache.insert(
                counterparty_id,
                CacheEntry {
                    prediction,
                    pattern: Arc::new(pattern),
                    trained_at: Instant::now(),
                    training_in_flight: false,
                    last_access: Instant::now(),
                },
            );
            drop(cache);
            store.evict_if_oversized();
            debug!("trained client pattern for {}", counterparty_id);
        });
    }

    fn clear_in_flight(&self, counterparty_id: Uuid) {
        if let Some(entry) = self.cache.write().get_mut(&counterparty_id) {
            entry.training_in_flight = false;
        }
    }

    /// LRU-by-last-access eviction once the cache exceeds `config.max_size`,
    /// mirroring `cache/anagraphics.rs`'s `evict_if_oversized`.
    fn evict_if_oversized(&self) {
        let mut cache = self.cache.write();
        if cache.len() <= self.config.max_size {
            return;
        }
        let to_evict = ((cache.len() as f64) * self.config.eviction_pct).ceil() as usize;
        let mut by_access: Vec<(Uuid, Instant)> = cache.iter().map(|(id, e)| (*id, e.last_access)).collect();
        by_access.sort_by_key(|(_, t)| *t);

        for (id, _) in by_access.into_iter().take(to_evict) {
            cache.remove(&id);
        }
    }
}

/// Pure training step: amount clustering, temporal distribution fit, and
/// sequence stats, over a counterparty's historical payments.
fn train(counterparty_id: Uuid, history: &[HistoricalPayment]) -> (ClientPattern, PatternPrediction) {
    let intervals: Vec<i64> = history
        .iter()
        .map(|p| (p.payment_date - p.invoice_date).num_days().clamp(0, 365))
        .collect();

    let (cluster_count, noise_ratio) = cluster_amounts(history);
    let (mean_days, stddev_days) = temporal_stats(&intervals);
    let sequence_confidence = sequence_stats(history);

    let sample_weight = (history.len() as f64 / 50.0).min(1.0);
    let reliability_score = sample_weight * (1.0 - noise_ratio).max(0.0);

    let pattern = ClientPattern {
        counterparty_id,
        payment_intervals: intervals,
        amount_cluster_count: cluster_count,
        noise_ratio,
        temporal_mean_days: mean_days,
        temporal_stddev_days: stddev_days,
        reliability_score,
        version: 1,
        last_updated: now_from(history),
    };

    let amount_cluster_match = (1.0 - noise_ratio).clamp(0.0, 1.0);
    let temporal_likelihood = if stddev_days > 0.0 {
        (1.0 - (stddev_days / mean_days.max(1.0))).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let overall_confidence =
        (0.4 * amount_cluster_match + 0.4 * temporal_likelihood + 0.2 * sequence_confidence).clamp(0.0, 1.0);

    let prediction = PatternPrediction {
        amount_cluster_match,
        temporal_likelihood,
        overall_confidence,
    };

    (pattern, prediction)
}

/// Density-based clustering over standardized amounts: sort, then split
/// into clusters wherever the gap between consecutive (standardized)
/// values exceeds a fixed threshold. Points in clusters of size 1 count as
/// noise, matching the density-clustering "noise ratio" concept without
/// pulling in a full DBSCAN implementation.
fn cluster_amounts(history: &[HistoricalPayment]) -> (usize, f64) {
    let amounts: Vec<f64> = history.iter().filter_map(|p| p.amount.to_f64()).collect();
    if amounts.is_empty() {
        return (0, 1.0);
    }
    let mean = amounts.iter().sum::<f64>() / amounts.len() as f64;
    let variance = amounts.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / amounts.len() as f64;
    let stddev = variance.sqrt().max(1e-6);

    let mut standardized: Vec<f64> = amounts.iter().map(|a| (a - mean) / stddev).collect();
    standardized.sort_by(|a, b| a.partial_cmp(b).unwrap());

    const GAP_THRESHOLD: f64 = 0.5;
    let mut clusters: Vec<Vec<f64>> = Vec::new();
    let mut current = vec![standardized[0]];
    for window in standardized.windows(2) {
        if window[1] - window[0] > GAP_THRESHOLD {
            clusters.push(std::mem::take(&mut current));
        }
        current.push(window[1]);
    }
    clusters.push(current);

    let noise_points: usize = clusters.iter().filter(|c| c.len() == 1).map(|c| c.len()).sum();
    let cluster_count = clusters.iter().filter(|c| c.len() > 1).count();
    let noise_ratio = noise_points as f64 / standardized.len() as f64;
    (cluster_count, noise_ratio)
}

fn temporal_stats(intervals: &[i64]) -> (f64, f64) {
    if intervals.is_empty() {
        return (0.0, 0.0);
    }
    let mean = intervals.iter().sum::<i64>() as f64 / intervals.len() as f64;
    let variance =
        intervals.iter().map(|d| (*d as f64 - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    (mean, variance.sqrt())
}

/// Fraction of historical payments that reconciled against more than one
/// invoice, as a rough proxy for "this counterparty typically batches
/// invoices into one payment" (§4.7 sequence model).
fn sequence_stats(history: &[HistoricalPayment]) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let batched = history.iter().filter(|p| p.related_doc_numbers.len() > 1).count();
    batched as f64 / history.len() as f64
}

fn now_from(history: &[HistoricalPayment]) -> DateTime<Utc> {
    history
        .iter()
        .map(|p| p.payment_date)
        .max()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment(invoice_offset: i64, payment_offset: i64, amount: i64, related: usize) -> HistoricalPayment {
        let base = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        HistoricalPayment {
            invoice_date: base + chrono::Duration::days(invoice_offset),
            payment_date: base + chrono::Duration::days(payment_offset),
            amount: Decimal::new(amount, 2),
            description: "bonifico".to_string(),
            related_doc_numbers: (0..related).map(|i| i.to_string()).collect(),
        }
    }

    #[test]
    fn tight_cluster_of_similar_amounts_has_low_noise() {
        let history: Vec<HistoricalPayment> = (0..10)
            .map(|i| payment(i * 30, i * 30 + 15, 100000 + i, 1))
            .collect();
        let (_pattern, prediction) = train(Uuid::new_v4(), &history);
        assert!(prediction.amount_cluster_match > 0.5);
    }

    #[test]
    fn regular_fifteen_day_interval_yields_small_stddev() {
        let history: Vec<HistoricalPayment> = (0..10)
            .map(|i| payment(i * 30, i * 30 + 15, 50000, 1))
            .collect();
        let (pattern, _prediction) = train(Uuid::new_v4(), &history);
        assert!(pattern.temporal_stddev_days < 1.0);
    }

    #[test]
    fn sequence_stats_detects_batched_payments() {
        let history: Vec<HistoricalPayment> = (0..6).map(|i| payment(i * 10, i * 10 + 5, 20000, 3)).collect();
        assert_eq!(sequence_stats(&history), 1.0);
    }

    fn dummy_entry(last_access: Instant) -> CacheEntry {
        CacheEntry {
            prediction: PatternPrediction {
                amount_cluster_match: 0.0,
                temporal_likelihood: 0.0,
                overall_confidence: 0.0,
            },
            pattern: Arc::new(ClientPattern {
                counterparty_id: Uuid::new_v4(),
                payment_intervals: Vec::new(),
                amount_cluster_count: 0,
                noise_ratio: 0.0,
                temporal_mean_days: 0.0,
                temporal_stddev_days: 0.0,
                reliability_score: 0.0,
                version: 1,
                last_updated: Utc::now(),
            }),
            trained_at: Instant::now(),
            training_in_flight: false,
            last_access,
        }
    }

    #[test]
    fn evicts_least_recently_accessed_entries_once_over_the_cap() {
        let store = PatternStore::new(PatternConfig {
            min_records: 5,
            ttl_hours: 2,
            max_size: 2,
            eviction_pct: 0.5,
        });

        let oldest = Uuid::new_v4();
        let middle = Uuid::new_v4();
        let newest = Uuid::new_v4();
        let now = Instant::now();
        {
            let mut cache = store.cache.write();
            cache.insert(oldest, dummy_entry(now - Duration::from_secs(300)));
            cache.insert(middle, dummy_entry(now - Duration::from_secs(150)));
            cache.insert(newest, dummy_entry(now));
        }

        store.evict_if_oversized();

        let cache = store.cache.read();
        assert!(!cache.contains_key(&oldest));
        assert!(cache.contains_key(&newest));
    }
}
