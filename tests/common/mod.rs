//! In-memory Multicall transport for integration tests.
//!
//! Decodes each call's selector and arguments and answers from per-chain tables,
//! so the engine can be driven end to end without a node.

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::types::{Address, H160, U256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vault_balance_engine::chain_registry::StaticChainRegistry;
use vault_balance_engine::multicall::{Call, CallOutcome, MulticallTransport};
use vault_balance_engine::settings::ChainSettings;
use vault_balance_engine::{BalanceAggregator, BalanceError, Settings};

const DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
const SYMBOL: [u8; 4] = [0x95, 0xd8, 0x9b, 0x41];
const NAME: [u8; 4] = [0x06, 0xfd, 0xde, 0x03];
const BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
const GET_ETH_BALANCE: [u8; 4] = [0x4d, 0x23, 0x01, 0xcc];

pub const OWNER_A: Address = H160([0xab; 20]);
pub const OWNER_B: Address = H160([0xcd; 20]);

pub fn usdc() -> Address {
    "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse().unwrap()
}

pub fn dai() -> Address {
    "0xDA10009cBd5D07dd0CeCc66161FC93D7c9000da1".parse().unwrap()
}

#[derive(Debug, Clone)]
pub struct TokenMeta {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Default)]
pub struct MockMulticall {
    meta: Mutex<HashMap<(u64, Address), TokenMeta>>,
    /// (chain, token or multicall-native, owner) -> raw balance
    balances: Mutex<HashMap<(u64, Address, Address), U256>>,
    native: Mutex<HashMap<(u64, Address), U256>>,
    failing: Mutex<HashSet<u64>>,
    fail_next: Mutex<HashMap<u64, usize>>,
    delays: Mutex<HashMap<u64, Duration>>,
    batches: AtomicUsize,
    calls: AtomicUsize,
    /// (chain, calls in batch) per aggregate invocation
    log: Mutex<Vec<(u64, usize)>>,
}

impl MockMulticall {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_token(&self, chain_id: u64, address: Address, symbol: &str, decimals: u8) {
        self.meta.lock().unwrap().insert(
            (chain_id, address),
            TokenMeta {
                name: format!("{} Token", symbol),
                symbol: symbol.to_string(),
                decimals,
            },
        );
    }

    pub fn set_balance(&self, chain_id: u64, token: Address, owner: Address, raw: U256) {
        self.balances
            .lock()
            .unwrap()
            .insert((chain_id, token, owner), raw);
    }

    pub fn set_native_balance(&self, chain_id: u64, owner: Address, raw: U256) {
        self.native.lock().unwrap().insert((chain_id, owner), raw);
    }

    pub fn fail_chain(&self, chain_id: u64) {
        self.failing.lock().unwrap().insert(chain_id);
    }

    pub fn heal_chain(&self, chain_id: u64) {
        self.failing.lock().unwrap().remove(&chain_id);
    }

    /// The next `times` batches on the chain fail with a transport error.
    pub fn fail_next(&self, chain_id: u64, times: usize) {
        self.fail_next.lock().unwrap().insert(chain_id, times);
    }

    pub fn set_delay(&self, chain_id: u64, delay: Duration) {
        self.delays.lock().unwrap().insert(chain_id, delay);
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_log(&self) -> Vec<(u64, usize)> {
        self.log.lock().unwrap().clone()
    }

    fn answer(&self, chain_id: u64, call: &Call) -> CallOutcome {
        let data = call.call_data.as_ref();
        if data.len() < 4 {
            return CallOutcome::failed();
        }
        let (selector, args) = data.split_at(4);
        let arg_address = || Address::from_slice(&args[12..32]);
        let meta = self.meta.lock().unwrap().get(&(chain_id, call.target)).cloned();

        match <[u8; 4]>::try_from(selector).unwrap() {
            DECIMALS => match meta {
                Some(m) => CallOutcome::ok(encode(&[Token::Uint(U256::from(m.decimals))])),
                None => CallOutcome::failed(),
            },
            SYMBOL => match meta {
                Some(m) => CallOutcome::ok(encode(&[Token::String(m.symbol)])),
                None => CallOutcome::failed(),
            },
            NAME => match meta {
                Some(m) => CallOutcome::ok(encode(&[Token::String(m.name)])),
                None => CallOutcome::failed(),
            },
            BALANCE_OF => {
                let owner = arg_address();
                let raw = self
                    .balances
                    .lock()
                    .unwrap()
                    .get(&(chain_id, call.target, owner))
                    .copied()
                    .unwrap_or_default();
                CallOutcome::ok(encode(&[Token::Uint(raw)]))
            }
            GET_ETH_BALANCE => {
                let owner = arg_address();
                let raw = self
                    .native
                    .lock()
                    .unwrap()
                    .get(&(chain_id, owner))
                    .copied()
                    .unwrap_or_default();
                CallOutcome::ok(encode(&[Token::Uint(raw)]))
            }
            _ => CallOutcome::failed(),
        }
    }
}

#[async_trait]
impl MulticallTransport for MockMulticall {
    async fn aggregate(
        &self,
        chain_id: u64,
        calls: Vec<Call>,
    ) -> Result<Vec<CallOutcome>, BalanceError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.calls.fetch_add(calls.len(), Ordering::SeqCst);
        self.log.lock().unwrap().push((chain_id, calls.len()));

        let delay = self.delays.lock().unwrap().get(&chain_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(&chain_id) {
            return Err(BalanceError::transport(chain_id, "connection refused"));
        }
        {
            let mut fail_next = self.fail_next.lock().unwrap();
            if let Some(left) = fail_next.get_mut(&chain_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(BalanceError::transport(chain_id, "503 Service Unavailable"));
                }
            }
        }
        Ok(calls.iter().map(|c| self.answer(chain_id, c)).collect())
    }
}

/// Settings with no pacing on the given chains and millisecond retries.
pub fn fast_settings(chains: &[u64]) -> Settings {
    let mut settings = Settings::default();
    settings.retry.base_delay_ms = 10;
    settings.retry.max_delay_ms = 50;
    for chain_id in chains {
        settings.chains.insert(
            chain_id.to_string(),
            ChainSettings {
                delay_ms: Some(0),
                ..Default::default()
            },
        );
    }
    settings
}

pub fn aggregator(mock: &Arc<MockMulticall>, settings: &Settings) -> Arc<BalanceAggregator> {
    let registry = Arc::new(StaticChainRegistry::from_settings(settings));
    Arc::new(BalanceAggregator::from_settings(
        Arc::clone(mock) as Arc<dyn MulticallTransport>,
        registry,
        settings,
    ))
}
