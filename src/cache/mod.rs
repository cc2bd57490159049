//! C2: anagraphics cache. In-process, thread-safe — the teacher's `cache.rs`
//! is Redis-backed (a separate process); spec §4.2 describes a "process-wide,
//! thread-safe index" with no external store named, so this is re-targeted
//! to an in-memory structure guarded by the teacher's choice of lock
//! (`parking_lot`, already a workspace dependency) instead of a Redis round
//! trip. The TTL constants, eviction-fraction knob, and hit/miss/set/delete
//! `CacheMetrics` struct are kept as-is from the teacher's shape.

pub mod anagraphics;

pub use anagraphics::AnagraphicsCache;

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub refreshes: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_handles_zero_total() {
        assert_eq!(CacheMetrics::default().hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_computes_percentage() {
        let metrics = CacheMetrics {
            hits: 8,
            misses: 2,
            ..Default::default()
        };
        assert_eq!(metrics.hit_rate(), 80.0);
    }
}
