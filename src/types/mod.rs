//! Shared data model: token records, queries, batched calls and per-chain status.

pub mod conversions;

use ethers::abi::Token;
use ethers::types::{Address, H160, U256};
use serde::Serialize;
use std::collections::HashMap;

use self::conversions::{format_amount, to_normalized};

/// Pseudo-address used for a chain's native currency.
pub const NATIVE_TOKEN_ADDRESS: Address = H160([0xee; 20]);

/// Canonical Multicall3 deployment, identical on nearly every EVM chain.
pub const MULTICALL3_ADDRESS: Address = H160([
    0xca, 0x11, 0xbd, 0xe0, 0x59, 0x77, 0xb3, 0x63, 0x11, 0x67, 0x02, 0x88, 0x62, 0xbe, 0x2a,
    0x17, 0x39, 0x76, 0xca, 0x11,
]);

pub const DEFAULT_DECIMALS: u8 = 18;

/// chainID -> token address -> record
pub type ChainBalanceMap = HashMap<u64, HashMap<Address, TokenRecord>>;

/// Raw on-chain amount plus its human-scale renderings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    pub raw: U256,
    pub normalized: f64,
    pub display: String,
}

impl Balance {
    pub fn new(raw: U256, decimals: u8) -> Self {
        Self {
            raw,
            normalized: to_normalized(raw, decimals),
            display: format_amount(raw, decimals),
        }
    }

    pub fn zero() -> Self {
        Self {
            raw: U256::zero(),
            normalized: 0.0,
            display: "0".to_string(),
        }
    }
}

impl Default for Balance {
    fn default() -> Self {
        Self::zero()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenRecord {
    pub address: Address,
    #[serde(rename = "chainID")]
    pub chain_id: u64,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub balance: Balance,
    /// USD value of `balance`, when a price is known.
    pub value: Option<f64>,
}

impl TokenRecord {
    /// Record seeded from a query's hints, before anything was read on-chain.
    pub fn from_query(query: &TokenQuery) -> Self {
        Self {
            address: query.address,
            chain_id: query.chain_id,
            name: query.name.clone().unwrap_or_default(),
            symbol: query.symbol.clone().unwrap_or_default(),
            decimals: query.decimals.filter(|d| *d != 0).unwrap_or(0),
            balance: Balance::zero(),
            value: None,
        }
    }

    pub fn is_native(&self) -> bool {
        self.address == NATIVE_TOKEN_ADDRESS
    }

    /// Decimals to use for maths: an unresolved (zero) value reads as 18.
    pub fn resolved_decimals(&self) -> u8 {
        if self.decimals == 0 {
            DEFAULT_DECIMALS
        } else {
            self.decimals
        }
    }

    /// Merges a freshly decoded record into this one.
    ///
    /// `name`, `symbol` and `decimals` keep the first non-empty / non-zero value;
    /// `balance` is always overwritten, rescaled with the kept decimals so the
    /// record stays self-consistent. A transient empty decode therefore cannot
    /// clobber good metadata, but a bad first decode sticks until the entry is
    /// rebuilt.
    pub fn merge_from(&mut self, fresh: &TokenRecord) {
        if self.name.is_empty() {
            self.name = fresh.name.clone();
        }
        if self.symbol.is_empty() {
            self.symbol = fresh.symbol.clone();
        }
        if self.decimals == 0 {
            self.decimals = fresh.decimals;
        }
        self.balance = if self.resolved_decimals() == fresh.resolved_decimals() {
            fresh.balance.clone()
        } else {
            Balance::new(fresh.balance.raw, self.resolved_decimals())
        };
        if fresh.value.is_some() {
            self.value = fresh.value;
        }
    }

    /// Sets `value` from a USD unit price.
    pub fn with_price(mut self, price: f64) -> Self {
        self.value = Some(self.balance.normalized * price);
        self
    }
}

/// A token to look up on one chain, with optional metadata hints.
///
/// A non-zero `decimals` hint or a non-empty `name`/`symbol` hint suppresses the
/// matching contract read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenQuery {
    pub address: Address,
    pub chain_id: u64,
    pub decimals: Option<u8>,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

impl TokenQuery {
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self {
            address,
            chain_id,
            decimals: None,
            name: None,
            symbol: None,
        }
    }

    pub fn native(chain_id: u64) -> Self {
        Self::new(chain_id, NATIVE_TOKEN_ADDRESS)
    }

    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn is_native(&self) -> bool {
        self.address == NATIVE_TOKEN_ADDRESS
    }

    pub fn has_decimals_hint(&self) -> bool {
        matches!(self.decimals, Some(d) if d != 0)
    }

    pub fn has_name_hint(&self) -> bool {
        self.name.as_deref().map_or(false, |s| !s.is_empty())
    }

    pub fn has_symbol_hint(&self) -> bool {
        self.symbol.as_deref().map_or(false, |s| !s.is_empty())
    }
}

/// Read-only function a batched call invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AbiFunction {
    Decimals,
    Symbol,
    Name,
    BalanceOf,
    GetEthBalance,
}

impl AbiFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbiFunction::Decimals => "decimals",
            AbiFunction::Symbol => "symbol",
            AbiFunction::Name => "name",
            AbiFunction::BalanceOf => "balanceOf",
            AbiFunction::GetEthBalance => "getEthBalance",
        }
    }
}

/// One contract read inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCall {
    /// Contract being called: the token itself, or the multicall contract for native reads.
    pub address: Address,
    pub function: AbiFunction,
    pub args: Vec<Token>,
}

/// Per-chain progress flags. `loading` goes true on start, then exactly one of
/// `success`/`error` becomes true and the status stays put for that invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChainStatus {
    pub loading: bool,
    pub success: bool,
    pub error: bool,
}

impl ChainStatus {
    pub fn loading() -> Self {
        Self {
            loading: true,
            success: false,
            error: false,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            loading: false,
            success: true,
            error: false,
        }
    }

    pub fn failed() -> Self {
        Self {
            loading: false,
            success: false,
            error: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.success || self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, symbol: &str, decimals: u8, raw: u64) -> TokenRecord {
        TokenRecord {
            address: Address::repeat_byte(1),
            chain_id: 1,
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals,
            balance: Balance::new(U256::from(raw), if decimals == 0 { 18 } else { decimals }),
            value: None,
        }
    }

    #[test]
    fn test_merge_keeps_metadata_overwrites_balance() {
        let mut existing = record("USD Coin", "USDC", 6, 1_000_000);
        let fresh = record("", "XXX", 18, 5_000_000);
        existing.merge_from(&fresh);

        assert_eq!(existing.name, "USD Coin");
        assert_eq!(existing.symbol, "USDC");
        assert_eq!(existing.decimals, 6);
        assert_eq!(existing.balance.raw, U256::from(5_000_000u64));
        // Balance follows the decimals the record keeps, not the fresh ones.
        assert_eq!(existing.balance.display, "5");
        assert_eq!(existing.balance.normalized, 5.0);
    }

    #[test]
    fn test_merge_fills_empty_metadata() {
        let mut existing = record("", "", 0, 0);
        existing.merge_from(&record("Dai", "DAI", 18, 7));
        assert_eq!(existing.name, "Dai");
        assert_eq!(existing.symbol, "DAI");
        assert_eq!(existing.decimals, 18);
    }

    #[test]
    fn test_hints() {
        let q = TokenQuery::new(1, Address::repeat_byte(2))
            .with_decimals(0)
            .with_name("")
            .with_symbol("USDC");
        assert!(!q.has_decimals_hint());
        assert!(!q.has_name_hint());
        assert!(q.has_symbol_hint());
        assert!(TokenQuery::native(10).is_native());
    }

    #[test]
    fn test_with_price() {
        let r = record("Dai", "DAI", 18, 2_000_000_000_000_000_000).with_price(1.5);
        assert_eq!(r.value, Some(3.0));
    }

    #[test]
    fn test_multicall3_constant() {
        assert_eq!(
            conversions::address_to_string(MULTICALL3_ADDRESS),
            "0xca11bde05977b3631167028862be2a173976ca11"
        );
    }
}
