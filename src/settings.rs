use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// How long a cached token record may be served without refetching.
    #[serde(default = "default_freshness_window_ms")]
    pub freshness_window_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_freshness_window_ms() -> u64 {
    60_000
}
fn default_max_entries() -> usize {
    10_000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            freshness_window_ms: default_freshness_window_ms(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorSettings {
    /// Tokens per batched request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Chain fetched (and published) before all others.
    #[serde(default)]
    pub priority_chain: Option<u64>,
}

fn default_chunk_size() -> usize {
    200
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            priority_chain: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// First backoff delay; doubles on every retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> usize {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000 // react to RPC outages within half a minute
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Per-chain overrides. Anything left unset falls back to the builtin chain table.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChainSettings {
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub multicall_address: Option<String>,
    #[serde(default)]
    pub stale_time_ms: Option<u64>,
    #[serde(default)]
    pub gc_time_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub native_name: Option<String>,
    #[serde(default)]
    pub native_symbol: Option<String>,
    #[serde(default)]
    pub native_decimals: Option<u8>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub aggregator: AggregatorSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Keyed by chain ID as a string (TOML table keys are strings).
    #[serde(default)]
    pub chains: HashMap<String, ChainSettings>,
}

const ENV_PREFIX: &str = "BALANCES";
const RPC_ENV_PREFIX: &str = "BALANCES_RPC_";

impl Settings {
    /// Loads `Config.toml` from the working directory if present, then
    /// `BALANCES__SECTION__KEY` environment overrides, then `BALANCES_RPC_<chainID>`.
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_rpc_env(env::vars());
        Ok(settings)
    }

    /// Loads an explicit configuration file, without environment overrides.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;
        s.try_deserialize()
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainSettings> {
        self.chains.get(&chain_id.to_string())
    }

    /// Chain IDs with an explicit section, skipping keys that are not numbers.
    pub fn configured_chains(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .chains
            .keys()
            .filter_map(|k| k.trim().parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn apply_rpc_env(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            let Some(chain) = key.strip_prefix(RPC_ENV_PREFIX) else {
                continue;
            };
            let Ok(chain_id) = chain.parse::<u64>() else {
                continue;
            };
            let url = value.trim();
            if url.is_empty() {
                continue;
            }
            self.chains
                .entry(chain_id.to_string())
                .or_default()
                .rpc_url = Some(url.to_string());
        }
    }
}
