use serde::{Deserialize, Serialize};

use crate::debug::DEFAULT_DEBUG_CAPACITY;
use crate::reconnect::BackoffPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub cache: CacheTtlConfig,
    #[serde(default = "default_debug_capacity")]
    pub debug_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            cache: CacheTtlConfig::default(),
            debug_capacity: DEFAULT_DEBUG_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Create from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backoff: BackoffPolicy {
                base_ms: env_u64("TETHER_BACKOFF_BASE_MS", defaults.backoff.base_ms),
                max_ms: env_u64("TETHER_BACKOFF_MAX_MS", defaults.backoff.max_ms),
                jitter_ms: env_u64("TETHER_BACKOFF_JITTER_MS", defaults.backoff.jitter_ms),
                max_retries: env_u64("TETHER_BACKOFF_MAX_RETRIES", defaults.backoff.max_retries as u64)
                    as u32,
            },
            cache: CacheTtlConfig {
                stale_after_secs: env_u64(
                    "TETHER_CACHE_STALE_AFTER_SECS",
                    defaults.cache.stale_after_secs,
                ),
                retain_secs: env_u64("TETHER_CACHE_RETAIN_SECS", defaults.cache.retain_secs),
            },
            debug_capacity: env_u64("TETHER_DEBUG_CAPACITY", defaults.debug_capacity as u64)
                as usize,
        }
    }
}

/// Freshness and retention horizons for cache entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    /// Seconds before an entry is considered stale.
    pub stale_after_secs: u64,
    /// Seconds before an entry may be garbage-collected.
    pub retain_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30,
            retain_secs: 300,
        }
    }
}

fn default_debug_capacity() -> usize {
    DEFAULT_DEBUG_CAPACITY
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
