//! # Vault Balance Engine
//!
//! Multi-chain token balance aggregation for DeFi vault frontends. Given any set
//! of `(token, chain)` pairs and a wallet owner, it fetches balances and token
//! metadata across independent EVM chains with as few RPC round trips as
//! possible, and publishes them without ever exposing a half-updated map.
//!
//! ## Architecture
//!
//! ### Configuration
//! [`chain_config`] maps a chain to its cache windows and rate limits;
//! [`chain_registry`] supplies native-currency metadata, the multicall contract
//! and RPC endpoint; [`settings`] layers both from `Config.toml` and the
//! environment.
//!
//! ### Fetch path
//! [`batch_builder`] plans the minimal contract reads for one chain,
//! [`balance_fetcher`] sends them as one Multicall3 batch through a
//! [`multicall::MulticallTransport`] and decodes the results into
//! [`types::TokenRecord`]s, writing each into the [`cache::FreshnessCache`].
//!
//! ### Scheduling
//! [`rate_limiter::ChainQueue`] paces and bounds requests per chain.
//! [`aggregator::BalanceAggregator`] drives full and partial refreshes,
//! chunking, retries, per-chain status and generation-guarded commits.

/// Shared data model
pub mod types;
/// Error taxonomy
pub mod error;

// Configuration
/// Configuration management
pub mod settings;
/// Per-chain cache windows and rate limits
pub mod chain_config;
/// Native currency, multicall contract and RPC endpoint per chain
pub mod chain_registry;

// Fetch path
/// Smart contract ABIs (read-only)
pub mod contracts;
/// Multicall batch RPC transport
pub mod multicall;
/// Time-boxed token record cache
pub mod cache;
/// Contract read planning for one chain
pub mod batch_builder;
/// Batched fetch and decode for one chain
pub mod balance_fetcher;

// Scheduling
/// Per-chain request queue
pub mod rate_limiter;
/// Multi-chain refresh orchestration
pub mod aggregator;

// Infrastructure
/// Metrics and observability
pub mod metrics;

// Re-exports for convenience
pub use aggregator::{BalanceAggregator, RefreshReport};
pub use balance_fetcher::{balances_query_key, BalanceFetcher};
pub use cache::FreshnessCache;
pub use error::BalanceError;
pub use settings::Settings;
pub use types::{ChainBalanceMap, ChainStatus, TokenQuery, TokenRecord, NATIVE_TOKEN_ADDRESS};
pub use anyhow::Result;
