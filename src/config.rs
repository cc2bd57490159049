use serde::{Deserialize, Serialize};
use std::env;

/// Recognized configuration knobs (§6.4), nested the way the teacher
/// service groups its per-subsystem config structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub matching: MatchConfig,
    pub search: SearchConfig,
    pub engine: EngineConfig,
    pub pattern: PatternConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub http_port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection string, e.g. `sqlite://reconciliation.db` or
    /// `sqlite::memory:` for tests. Embedded: no network round trip to a
    /// separate database process.
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_minutes: u64,
    pub max_size: usize,
    pub eviction_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    pub min_confidence: f64,
    pub high_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub max_combination_size: usize,
    pub max_wallclock_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub workers: usize,
    pub memory_limit_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub min_records: usize,
    pub ttl_hours: u64,
    pub max_size: usize,
    pub eviction_pct: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                http_port: 8085,
                host: "0.0.0.0".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://reconciliation.db".to_string(),
                max_connections: 10,
            },
            cache: CacheConfig {
                ttl_minutes: 15,
                max_size: 10_000,
                eviction_pct: 0.2,
            },
            matching: MatchConfig {
                min_confidence: 0.15,
                high_confidence: 0.6,
            },
            search: SearchConfig {
                max_combination_size: 5,
                max_wallclock_ms: 30_000,
            },
            engine: EngineConfig {
                workers: 4,
                memory_limit_mb: 500,
            },
            pattern: PatternConfig {
                min_records: 5,
                ttl_hours: 2,
                max_size: 10_000,
                eviction_pct: 0.2,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenv::dotenv().ok();
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                http_port: env::var("HTTP_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.server.http_port),
                host: env::var("HOST").unwrap_or(defaults.server.host),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.database.max_connections),
            },
            cache: CacheConfig {
                ttl_minutes: env::var("CACHE_TTL_MINUTES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.cache.ttl_minutes),
                max_size: env::var("CACHE_MAX_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.cache.max_size),
                eviction_pct: env::var("CACHE_EVICTION_PCT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.cache.eviction_pct),
            },
            matching: MatchConfig {
                min_confidence: env::var("MATCH_MIN_CONFIDENCE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.matching.min_confidence),
                high_confidence: env::var("MATCH_HIGH_CONFIDENCE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.matching.high_confidence),
            },
            search: SearchConfig {
                max_combination_size: env::var("SEARCH_MAX_COMBINATION_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.search.max_combination_size),
                max_wallclock_ms: env::var("SEARCH_MAX_WALLCLOCK_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.search.max_wallclock_ms),
            },
            engine: EngineConfig {
                workers: env::var("ENGINE_WORKERS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.engine.workers),
                memory_limit_mb: env::var("ENGINE_MEMORY_LIMIT_MB")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.engine.memory_limit_mb),
            },
            pattern: PatternConfig {
                min_records: env::var("PATTERN_MIN_RECORDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.pattern.min_records),
                ttl_hours: env::var("PATTERN_TTL_HOURS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.pattern.ttl_hours),
                max_size: env::var("PATTERN_MAX_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.pattern.max_size),
                eviction_pct: env::var("PATTERN_EVICTION_PCT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.pattern.eviction_pct),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_knobs() {
        let config = Config::default();
        assert_eq!(config.cache.ttl_minutes, 15);
        assert_eq!(config.cache.max_size, 10_000);
        assert_eq!(config.matching.min_confidence, 0.15);
        assert_eq!(config.matching.high_confidence, 0.6);
        assert_eq!(config.search.max_combination_size, 5);
        assert_eq!(config.search.max_wallclock_ms, 30_000);
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.pattern.min_records, 5);
        assert_eq!(config.pattern.ttl_hours, 2);
    }
}
