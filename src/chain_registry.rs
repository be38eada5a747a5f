//! Chain registry: native currency metadata, multicall address and RPC endpoint
//! per chain. The engine only reads it; wallet frontends usually back it with
//! their connector's chain list.

use crate::settings::Settings;
use crate::types::conversions::string_to_address;
use crate::types::MULTICALL3_ADDRESS;
use ethers::types::Address;
use log::warn;
use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl NativeCurrency {
    fn new(name: &str, symbol: &str) -> Self {
        Self {
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals: 18,
        }
    }
}

pub trait ChainRegistry: Send + Sync {
    fn native_currency(&self, chain_id: u64) -> Option<NativeCurrency>;

    /// Multicall/aggregate contract, if the registry knows one for the chain.
    fn multicall_address(&self, chain_id: u64) -> Option<Address>;

    fn rpc_url(&self, chain_id: u64) -> Option<String>;

    /// Address native balances are read from via `getEthBalance`.
    fn aggregate_contract(&self, chain_id: u64) -> Address {
        self.multicall_address(chain_id).unwrap_or(MULTICALL3_ADDRESS)
    }
}

static BUILTIN_NATIVE: Lazy<HashMap<u64, NativeCurrency>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(1, NativeCurrency::new("Ether", "ETH"));
    m.insert(10, NativeCurrency::new("Ether", "ETH"));
    m.insert(100, NativeCurrency::new("xDAI", "XDAI"));
    m.insert(137, NativeCurrency::new("POL", "POL"));
    m.insert(250, NativeCurrency::new("Fantom", "FTM"));
    m.insert(8453, NativeCurrency::new("Ether", "ETH"));
    m.insert(42161, NativeCurrency::new("Ether", "ETH"));
    m
});

/// Registry backed by the builtin native-currency table plus settings.
#[derive(Debug, Clone, Default)]
pub struct StaticChainRegistry {
    native: HashMap<u64, NativeCurrency>,
    multicall: HashMap<u64, Address>,
    rpc: HashMap<u64, String>,
}

impl StaticChainRegistry {
    pub fn new() -> Self {
        Self {
            native: BUILTIN_NATIVE.clone(),
            multicall: HashMap::new(),
            rpc: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut registry = Self::new();
        for chain_id in settings.configured_chains() {
            let Some(chain) = settings.chain(chain_id) else {
                continue;
            };
            if let Some(url) = &chain.rpc_url {
                registry.rpc.insert(chain_id, url.clone());
            }
            if let Some(raw) = &chain.multicall_address {
                match string_to_address(raw) {
                    Ok(addr) => {
                        registry.multicall.insert(chain_id, addr);
                    }
                    Err(e) => warn!(
                        "Ignoring multicall_address for chain {}: {}",
                        chain_id, e
                    ),
                }
            }
            if chain.native_symbol.is_some() || chain.native_name.is_some() {
                let base = registry
                    .native
                    .get(&chain_id)
                    .cloned()
                    .unwrap_or_else(|| NativeCurrency::new("Ether", "ETH"));
                registry.native.insert(
                    chain_id,
                    NativeCurrency {
                        name: chain.native_name.clone().unwrap_or(base.name),
                        symbol: chain.native_symbol.clone().unwrap_or(base.symbol),
                        decimals: chain.native_decimals.unwrap_or(base.decimals),
                    },
                );
            }
        }
        registry
    }

    pub fn with_rpc(mut self, chain_id: u64, url: impl Into<String>) -> Self {
        self.rpc.insert(chain_id, url.into());
        self
    }

    pub fn with_multicall(mut self, chain_id: u64, address: Address) -> Self {
        self.multicall.insert(chain_id, address);
        self
    }

    pub fn with_native(mut self, chain_id: u64, native: NativeCurrency) -> Self {
        self.native.insert(chain_id, native);
        self
    }

    pub fn chains_with_rpc(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.rpc.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl ChainRegistry for StaticChainRegistry {
    fn native_currency(&self, chain_id: u64) -> Option<NativeCurrency> {
        self.native.get(&chain_id).cloned()
    }

    fn multicall_address(&self, chain_id: u64) -> Option<Address> {
        self.multicall.get(&chain_id).copied()
    }

    fn rpc_url(&self, chain_id: u64) -> Option<String> {
        self.rpc.get(&chain_id).cloned()
    }
}
