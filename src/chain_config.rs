//! Per-chain cache and rate-limit parameters.
//!
//! The free functions are pure lookups over the builtin table and always
//! return a value: unlisted chains get [`DEFAULT_CHAIN_CONFIG`]. Deployments
//! that need different numbers wrap the table in a [`ChainConfigRegistry`]
//! built from [`Settings`].

use crate::settings::Settings;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Age after which a cached record must be refetched.
    pub stale_time: Duration,
    /// Age after which a cached record is dropped altogether.
    pub gc_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Chunk fetches allowed in flight at once for the chain.
    pub max_concurrent: usize,
    /// Minimum spacing between request starts on the chain.
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainConfig {
    pub cache: CacheConfig,
    pub rate_limit: RateLimit,
}

pub const DEFAULT_CHAIN_CONFIG: ChainConfig = ChainConfig {
    cache: CacheConfig {
        stale_time: Duration::from_secs(60),
        gc_time: Duration::from_secs(5 * 60),
    },
    rate_limit: RateLimit {
        max_concurrent: 5,
        delay: Duration::from_millis(100),
    },
};

// Public RPCs on these chains answer 429 quickly under burst load.
const RATE_LIMIT_SENSITIVE: RateLimit = RateLimit {
    max_concurrent: 2,
    delay: Duration::from_millis(500),
};

const FAST_L2: RateLimit = RateLimit {
    max_concurrent: 8,
    delay: Duration::from_millis(50),
};

pub fn get_chain_cache_config(chain_id: u64) -> CacheConfig {
    match chain_id {
        // Mainnet balances move slowly relative to block time; keep longer.
        1 => CacheConfig {
            stale_time: Duration::from_secs(60),
            gc_time: Duration::from_secs(10 * 60),
        },
        10 | 8453 | 42161 => CacheConfig {
            stale_time: Duration::from_secs(60),
            gc_time: Duration::from_secs(5 * 60),
        },
        _ => DEFAULT_CHAIN_CONFIG.cache,
    }
}

pub fn get_chain_rate_limit(chain_id: u64) -> RateLimit {
    match chain_id {
        137 | 250 => RATE_LIMIT_SENSITIVE,
        10 | 8453 | 42161 => FAST_L2,
        _ => DEFAULT_CHAIN_CONFIG.rate_limit,
    }
}

pub fn get_chain_config(chain_id: u64) -> ChainConfig {
    ChainConfig {
        cache: get_chain_cache_config(chain_id),
        rate_limit: get_chain_rate_limit(chain_id),
    }
}

/// Builtin table plus per-chain overrides from settings.
#[derive(Debug, Clone, Default)]
pub struct ChainConfigRegistry {
    overrides: HashMap<u64, ChainConfig>,
    default_stale_time: Option<Duration>,
}

impl ChainConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut registry = Self {
            overrides: HashMap::new(),
            default_stale_time: Some(Duration::from_millis(settings.cache.freshness_window_ms)),
        };

        for chain_id in settings.configured_chains() {
            let Some(chain) = settings.chain(chain_id) else {
                continue;
            };
            let mut cfg = registry.get_chain_config(chain_id);
            if let Some(ms) = chain.stale_time_ms {
                cfg.cache.stale_time = Duration::from_millis(ms);
            }
            if let Some(ms) = chain.gc_time_ms {
                cfg.cache.gc_time = Duration::from_millis(ms);
            }
            if let Some(n) = chain.max_concurrent {
                cfg.rate_limit.max_concurrent = n.max(1);
            }
            if let Some(ms) = chain.delay_ms {
                cfg.rate_limit.delay = Duration::from_millis(ms);
            }
            registry.overrides.insert(chain_id, cfg);
        }
        registry
    }

    pub fn with_override(mut self, chain_id: u64, config: ChainConfig) -> Self {
        self.overrides.insert(chain_id, config);
        self
    }

    pub fn get_chain_config(&self, chain_id: u64) -> ChainConfig {
        if let Some(cfg) = self.overrides.get(&chain_id) {
            return *cfg;
        }
        let mut cfg = get_chain_config(chain_id);
        if let Some(stale) = self.default_stale_time {
            cfg.cache.stale_time = stale;
        }
        cfg
    }

    pub fn get_chain_cache_config(&self, chain_id: u64) -> CacheConfig {
        self.get_chain_config(chain_id).cache
    }

    /// Stale time set explicitly for the chain, if any. Other chains use the
    /// cache's own freshness window.
    pub fn stale_time_override(&self, chain_id: u64) -> Option<Duration> {
        self.overrides.get(&chain_id).map(|cfg| cfg.cache.stale_time)
    }

    pub fn get_chain_rate_limit(&self, chain_id: u64) -> RateLimit {
        self.get_chain_config(chain_id).rate_limit
    }
}
