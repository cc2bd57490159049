use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheMetrics;
use crate::config::CacheConfig;
use crate::errors::Result;
use crate::models::Counterparty;

/// Stop words stripped from denomination tokens before indexing: legal-form
/// suffixes and generic corporate terms (§4.2).
const STOP_WORDS: &[&str] = &[
    "SRL", "SPA", "SNC", "SAS", "SOCIETA", "SOCIETA'", "COOPERATIVA", "COOP",
    "SRLS", "GROUP", "HOLDING", "COMPANY", "AZIENDA", "DITTA", "ITALIA", "ITALY",
];

/// Supplies the full set of counterparty rows for a cache refresh. Kept as a
/// trait rather than a concrete `Repository` dependency so the cache can be
/// unit-tested without a database.
#[async_trait]
pub trait CounterpartySource: Send + Sync {
    async fn list_all_counterparties(&self) -> Result<Vec<Counterparty>>;
}

struct Inner {
    records: HashMap<Uuid, Counterparty>,
    fiscal_index: HashMap<String, Uuid>,
    token_index: HashMap<String, HashSet<Uuid>>,
    last_access: HashMap<Uuid, Instant>,
    loaded_at: Instant,
}

impl Inner {
    fn empty() -> Self {
        Inner {
            records: HashMap::new(),
            fiscal_index: HashMap::new(),
            token_index: HashMap::new(),
            last_access: HashMap::new(),
            loaded_at: Instant::now(),
        }
    }
}

/// C2: process-wide, thread-safe index over counterparties. A single
/// reentrant-style lock (`parking_lot::RwLock`) protects all mutations;
/// reads take the same lock for snapshot consistency.
pub struct AnagraphicsCache {
    inner: RwLock<Inner>,
    source: Arc<dyn CounterpartySource>,
    config: CacheConfig,
    memory_limit_mb: u64,
    metrics: RwLock<CacheMetrics>,
}

impl AnagraphicsCache {
    pub fn new(source: Arc<dyn CounterpartySource>, config: CacheConfig) -> Self {
        Self::with_memory_limit(source, config, 500)
    }

    pub fn with_memory_limit(
        source: Arc<dyn CounterpartySource>,
        config: CacheConfig,
        memory_limit_mb: u64,
    ) -> Self {
        AnagraphicsCache {
            inner: RwLock::new(Inner::empty()),
            source,
            config,
            memory_limit_mb,
            metrics: RwLock::new(CacheMetrics::default()),
        }
    }

    /// O(1) exact lookup. Normalizes the caller's code the same way fiscal
    /// identifiers are normalized on ingest (§3: uppercased, stripped of
    /// country prefix).
    pub async fn find_by_fiscal(&self, code: &str) -> Option<Uuid> {
        self.ensure_fresh().await;
        let normalized = normalize_fiscal_code(code);
        let hit = self.inner.read().fiscal_index.get(&normalized).copied();
        self.record(hit.is_some());
        hit
    }

    /// Intersection of postings lists for the given token set.
    pub async fn search_by_tokens(&self, tokens: &HashSet<String>) -> HashSet<Uuid> {
        self.ensure_fresh().await;
        let inner = self.inner.read();
        let mut iter = tokens.iter().filter_map(|t| inner.token_index.get(t));
        let Some(first) = iter.next() else {
            self.record(false);
            return HashSet::new();
        };
        let result = iter.fold(first.clone(), |acc, set| acc.intersection(set).copied().collect());
        self.record(!result.is_empty());
        result
    }

    pub async fn get(&self, id: Uuid) -> Option<Counterparty> {
        self.ensure_fresh().await;
        self.touch(id);
        let hit = self.inner.read().records.get(&id).cloned();
        self.record(hit.is_some());
        hit
    }

    fn touch(&self, id: Uuid) {
        self.inner.write().last_access.insert(id, Instant::now());
    }

    fn record(&self, hit: bool) {
        let mut metrics = self.metrics.write();
        if hit {
            metrics.hits += 1;
        } else {
            metrics.misses += 1;
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        *self.metrics.read()
    }

    pub fn reset_metrics(&self) {
        *self.metrics.write() = CacheMetrics::default();
    }

    /// Triggers a full refresh if the TTL has elapsed, unless the refresh
    /// would exceed the configured memory ceiling (§4.2 "refresh is skipped
    /// if process RSS exceeds a configured memory ceiling").
    async fn ensure_fresh(&self) {
        let stale = {
            let inner = self.inner.read();
            inner.records.is_empty()
                || inner.loaded_at.elapsed() > Duration::from_secs(self.config.ttl_minutes * 60)
        };
        if !stale {
            return;
        }
        if let Err(e) = self.refresh().await {
            warn!("anagraphics cache refresh failed: {}", e);
        }
    }

    /// Unconditional refresh from the persistence layer, rebuilding both
    /// indices in lockstep.
    pub async fn refresh(&self) -> Result<()> {
        if approx_rss_mb() > self.memory_limit_mb {
            warn!(
                "skipping anagraphics refresh: RSS above {}MB ceiling",
                self.memory_limit_mb
            );
            return Ok(());
        }

        let rows = self.source.list_all_counterparties().await?;
        let mut fiscal_index = HashMap::new();
        let mut token_index: HashMap<String, HashSet<Uuid>> = HashMap::new();
        let mut records = HashMap::new();

        for cp in rows {
            if let Some(fid) = &cp.fiscal_id {
                fiscal_index.insert(normalize_fiscal_code(fid), cp.id);
            }
            if let Some(tax) = &cp.tax_code {
                fiscal_index.insert(normalize_fiscal_code(tax), cp.id);
            }
            for token in tokenize(&cp.denomination) {
                token_index.entry(token).or_default().insert(cp.id);
            }
            records.insert(cp.id, cp);
        }

        let mut inner = self.inner.write();
        let previous_access = std::mem::take(&mut inner.last_access);
        *inner = Inner {
            records,
            fiscal_index,
            token_index,
            last_access: previous_access,
            loaded_at: Instant::now(),
        };
        drop(inner);

        self.metrics.write().refreshes += 1;
        self.evict_if_oversized();
        debug!("anagraphics cache refreshed");
        Ok(())
    }

    /// LRU eviction by last-access timestamp, triggered once the cache
    /// exceeds `max_size` (§4.2 high-water mark / eviction fraction).
    fn evict_if_oversized(&self) {
        let mut inner = self.inner.write();
        if inner.records.len() <= self.config.max_size {
            return;
        }
        let to_evict = ((inner.records.len() as f64) * self.config.eviction_pct).ceil() as usize;
        let mut by_access: Vec<(Uuid, Instant)> = inner
            .records
            .keys()
            .map(|id| {
                (
                    *id,
                    inner.last_access.get(id).copied().unwrap_or(Instant::now()),
                )
            })
            .collect();
        by_access.sort_by_key(|(_, t)| *t);

        let mut evicted = 0;
        for (id, _) in by_access {
            if evicted >= to_evict {
                break;
            }
            if let Some(cp) = inner.records.remove(&id) {
                if let Some(fid) = &cp.fiscal_id {
                    inner.fiscal_index.remove(&normalize_fiscal_code(fid));
                }
                if let Some(tax) = &cp.tax_code {
                    inner.fiscal_index.remove(&normalize_fiscal_code(tax));
                }
                for token in tokenize(&cp.denomination) {
                    if let Some(set) = inner.token_index.get_mut(&token) {
                        set.remove(&id);
                    }
                }
                inner.last_access.remove(&id);
                evicted += 1;
            }
        }
        drop(inner);
        self.metrics.write().evictions += evicted as u64;
        if evicted > 0 {
            info!("evicted {} anagraphics cache entries", evicted);
        }
    }
}

fn normalize_fiscal_code(code: &str) -> String {
    let upper = code.trim().to_uppercase();
    // Strip a leading two-letter ISO country prefix (e.g. "IT01234567890").
    if upper.len() > 2 && upper.chars().take(2).all(|c| c.is_ascii_alphabetic()) {
        let rest = &upper[2..];
        if rest.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            return rest.to_string();
        }
    }
    upper
}

/// Tokenizes a denomination into indexable terms: length >= 3, stop words
/// removed, uppercased.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_uppercase())
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

#[cfg(target_os = "linux")]
fn approx_rss_mb() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).map(|s| s.to_string()))
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096 / (1024 * 1024))
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn approx_rss_mb() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CounterpartyKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixtureSource {
        rows: Vec<Counterparty>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterpartySource for FixtureSource {
        async fn list_all_counterparties(&self) -> Result<Vec<Counterparty>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.clone())
        }
    }

    fn sample(denomination: &str, fiscal_id: Option<&str>) -> Counterparty {
        Counterparty {
            id: Uuid::new_v4(),
            kind: CounterpartyKind::Customer,
            denomination: denomination.to_string(),
            fiscal_id: fiscal_id.map(|s| s.to_string()),
            tax_code: None,
            score: None,
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            ttl_minutes: 15,
            max_size: 10_000,
            eviction_pct: 0.2,
        }
    }

    #[tokio::test]
    async fn finds_by_fiscal_code_regardless_of_case_and_prefix() {
        let cp = sample("ROSSI SRL", Some("IT01234567890"));
        let id = cp.id;
        let source = Arc::new(FixtureSource {
            rows: vec![cp],
            calls: AtomicUsize::new(0),
        });
        let cache = AnagraphicsCache::new(source, config());
        assert_eq!(cache.find_by_fiscal("it01234567890").await, Some(id));
        assert_eq!(cache.find_by_fiscal("01234567890").await, Some(id));
    }

    #[tokio::test]
    async fn token_search_intersects_postings() {
        let a = sample("ROSSI COSTRUZIONI SRL", None);
        let b = sample("ROSSI TRASPORTI SRL", None);
        let a_id = a.id;
        let source = Arc::new(FixtureSource {
            rows: vec![a, b],
            calls: AtomicUsize::new(0),
        });
        let cache = AnagraphicsCache::new(source, config());
        let tokens: HashSet<String> = ["ROSSI".to_string(), "COSTRUZIONI".to_string()]
            .into_iter()
            .collect();
        let hits = cache.search_by_tokens(&tokens).await;
        assert_eq!(hits, [a_id].into_iter().collect());
    }

    #[tokio::test]
    async fn tokenize_drops_stop_words_and_short_tokens() {
        let tokens = tokenize("Rossi Costruzioni SRL Di Mario & C.");
        assert!(tokens.contains("ROSSI"));
        assert!(tokens.contains("COSTRUZIONI"));
        assert!(!tokens.contains("SRL"));
        assert!(!tokens.contains("DI"));
    }
}
