//! # Balance Snapshot
//!
//! One-shot diagnostic: runs a single full refresh for an owner and prints the
//! resulting balance map as JSON.
//!
//! ## Usage
//!
//! ```bash
//! BALANCES_RPC_1=https://eth.llamarpc.com \
//! cargo run --bin balance_snapshot -- \
//!     --owner 0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045 \
//!     --token 1:native --token 1:0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use ethers::types::Address;
use log::{info, warn};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use vault_balance_engine::chain_registry::StaticChainRegistry;
use vault_balance_engine::multicall::EthersMulticall;
use vault_balance_engine::{BalanceAggregator, Settings, TokenQuery};

#[derive(Debug, Parser)]
#[command(name = "balance_snapshot", about = "Fetch multi-chain token balances once")]
struct Args {
    /// Wallet whose balances are read
    #[arg(long)]
    owner: Option<String>,

    /// Token as `chainID:address`, or `chainID:native` for the native currency
    #[arg(long = "token", required = true)]
    tokens: Vec<String>,

    /// Chain fetched before all others
    #[arg(long)]
    priority_chain: Option<u64>,

    /// Ignore the freshness cache
    #[arg(long)]
    force: bool,

    /// Optional configuration file (defaults to ./Config.toml + environment)
    #[arg(long)]
    config: Option<String>,

    /// Prometheus listener, e.g. 127.0.0.1:9000
    #[cfg(feature = "observability")]
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,
}

fn parse_token(raw: &str) -> Result<TokenQuery> {
    let (chain, address) = raw
        .split_once(':')
        .with_context(|| format!("token `{}` is not chainID:address", raw))?;
    let chain_id = chain.trim().parse::<u64>().context("bad chain ID")?;
    if address.trim().eq_ignore_ascii_case("native") {
        return Ok(TokenQuery::native(chain_id));
    }
    let address = Address::from_str(address.trim()).context("bad token address")?;
    Ok(TokenQuery::new(chain_id, address))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    env_logger::init();

    let args = Args::parse();

    #[cfg(feature = "observability")]
    {
        // Structured output for the rate limiter's tracing events.
        let _ = tracing_subscriber::fmt().json().try_init();
        if let Some(addr) = args.metrics_addr {
            vault_balance_engine::metrics::install_prometheus_exporter(addr)?;
        }
    }

    let mut settings = match &args.config {
        Some(path) => Settings::from_path(path)?,
        None => Settings::new()?,
    };
    if args.priority_chain.is_some() {
        settings.aggregator.priority_chain = args.priority_chain;
    }

    let tokens = args
        .tokens
        .iter()
        .map(|t| parse_token(t))
        .collect::<Result<Vec<_>>>()?;
    let owner = args
        .owner
        .as_deref()
        .map(Address::from_str)
        .transpose()
        .context("bad owner address")?;

    let registry = Arc::new(StaticChainRegistry::from_settings(&settings));
    for token in &tokens {
        if !registry.chains_with_rpc().contains(&token.chain_id) {
            warn!(
                "No RPC configured for chain {} (set BALANCES_RPC_{})",
                token.chain_id, token.chain_id
            );
        }
    }
    let transport = Arc::new(EthersMulticall::new(registry.clone()));
    let aggregator = BalanceAggregator::from_settings(transport, registry, &settings);
    aggregator.set_owner(owner);
    aggregator.set_tokens(tokens);

    let report = aggregator.on_update(args.force).await;
    for (chain_id, err) in &report.failed {
        warn!("chain {} failed: {}", chain_id, err);
    }
    info!(
        "Committed {} chains in refresh #{}",
        report.committed.len(),
        report.generation
    );

    // Sorted output so consecutive runs diff cleanly.
    let data = aggregator.data();
    let sorted: BTreeMap<u64, BTreeMap<String, _>> = data
        .iter()
        .map(|(chain, records)| {
            (
                *chain,
                records
                    .iter()
                    .map(|(addr, record)| (format!("{:?}", addr), record))
                    .collect(),
            )
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&sorted)?);

    if report.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} chain(s) failed", report.failed.len())
    }
}
