//! Turns the token queries for one chain into the minimal list of contract reads.

use crate::cache::FreshnessCache;
use crate::chain_registry::ChainRegistry;
use crate::contracts::{ERC20_ABI, MULTICALL3_ABI};
use crate::error::BalanceError;
use crate::multicall::Call;
use crate::types::{AbiFunction, BatchCall, TokenQuery, TokenRecord};
use ethers::abi::Token;
use ethers::types::{Address, Bytes};
use std::collections::HashMap;
use std::time::Duration;

/// Output of [`build_calls`]: `calls[i]` was emitted for `origins[i]`.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    pub calls: Vec<BatchCall>,
    pub origins: Vec<TokenQuery>,
    /// Tokens fully served by the cache; they have no calls.
    pub cached: HashMap<Address, TokenRecord>,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn push(&mut self, origin: &TokenQuery, call: BatchCall) {
        self.calls.push(call);
        self.origins.push(origin.clone());
    }
}

/// Cache consulted while planning, with the freshness window to apply.
#[derive(Clone, Copy)]
pub struct CacheView<'a> {
    pub cache: &'a FreshnessCache,
    pub window: Duration,
}

/// Builds the reads for `tokens` on `chain_id`.
///
/// Per token not covered by `cache`: `decimals` unless a non-zero hint exists,
/// `symbol`/`name` unless a non-empty hint exists, and a balance read only when
/// `owner` is known. The native currency is never read through the ERC20 ABI:
/// its balance goes through the chain's aggregate contract (`getEthBalance`)
/// and its metadata comes from the registry, so it emits no metadata reads.
pub fn build_calls(
    chain_id: u64,
    tokens: &[TokenQuery],
    owner: Option<Address>,
    cache: Option<CacheView<'_>>,
    registry: &dyn ChainRegistry,
) -> BatchPlan {
    let mut plan = BatchPlan::default();
    let aggregate = registry.aggregate_contract(chain_id);

    for token in tokens {
        if let Some(view) = cache {
            if let Some(record) = view.cache.get_fresh(chain_id, token.address, owner, view.window) {
                plan.cached.insert(token.address, record);
                continue;
            }
        }

        if token.is_native() {
            if let Some(owner) = owner {
                plan.push(
                    token,
                    BatchCall {
                        address: aggregate,
                        function: AbiFunction::GetEthBalance,
                        args: vec![Token::Address(owner)],
                    },
                );
            }
            continue;
        }

        if !token.has_decimals_hint() {
            plan.push(token, erc20_read(token.address, AbiFunction::Decimals));
        }
        if !token.has_symbol_hint() {
            plan.push(token, erc20_read(token.address, AbiFunction::Symbol));
        }
        if !token.has_name_hint() {
            plan.push(token, erc20_read(token.address, AbiFunction::Name));
        }
        if let Some(owner) = owner {
            plan.push(
                token,
                BatchCall {
                    address: token.address,
                    function: AbiFunction::BalanceOf,
                    args: vec![Token::Address(owner)],
                },
            );
        }
    }
    plan
}

fn erc20_read(address: Address, function: AbiFunction) -> BatchCall {
    BatchCall {
        address,
        function,
        args: Vec::new(),
    }
}

fn abi_function(function: AbiFunction) -> Result<&'static ethers::abi::Function, BalanceError> {
    let abi = match function {
        AbiFunction::GetEthBalance => &*MULTICALL3_ABI,
        _ => &*ERC20_ABI,
    };
    abi.function(function.as_str())
        .map_err(|e| BalanceError::Abi(e.to_string()))
}

/// ABI-encodes a planned read into a transport call.
pub fn encode_call(call: &BatchCall) -> Result<Call, BalanceError> {
    let function = abi_function(call.function)?;
    let data = function
        .encode_input(&call.args)
        .map_err(|e| BalanceError::Abi(e.to_string()))?;
    Ok(Call {
        target: call.address,
        call_data: Bytes::from(data),
    })
}

/// Decodes a read's return data with the function's declared outputs.
/// `None` on any decode failure; the caller picks the default.
pub fn decode_output(function: AbiFunction, data: &[u8]) -> Option<Vec<Token>> {
    abi_function(function).ok()?.decode_output(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_registry::StaticChainRegistry;
    use crate::types::{MULTICALL3_ADDRESS, NATIVE_TOKEN_ADDRESS};

    fn usdc() -> Address {
        "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse().unwrap()
    }

    fn functions(plan: &BatchPlan) -> Vec<AbiFunction> {
        plan.calls.iter().map(|c| c.function).collect()
    }

    #[test]
    fn test_full_erc20_read_set() {
        let owner = Address::repeat_byte(0xab);
        let plan = build_calls(
            1,
            &[TokenQuery::new(1, usdc())],
            Some(owner),
            None,
            &StaticChainRegistry::new(),
        );
        assert_eq!(
            functions(&plan),
            vec![
                AbiFunction::Decimals,
                AbiFunction::Symbol,
                AbiFunction::Name,
                AbiFunction::BalanceOf
            ]
        );
        assert!(plan.calls.iter().all(|c| c.address == usdc()));
        assert_eq!(plan.origins.len(), plan.calls.len());
    }

    #[test]
    fn test_hints_suppress_metadata_reads() {
        let token = TokenQuery::new(1, usdc())
            .with_decimals(6)
            .with_symbol("USDC")
            .with_name("");
        let plan = build_calls(1, &[token], None, None, &StaticChainRegistry::new());
        // Empty name hint does not count; no owner means no balance read.
        assert_eq!(functions(&plan), vec![AbiFunction::Name]);
    }

    #[test]
    fn test_native_goes_through_aggregate_contract() {
        let owner = Address::repeat_byte(0xab);
        let registry = StaticChainRegistry::new();
        let plan = build_calls(1, &[TokenQuery::native(1)], Some(owner), None, &registry);
        assert_eq!(plan.calls.len(), 1);
        assert_eq!(plan.calls[0].function, AbiFunction::GetEthBalance);
        assert_eq!(plan.calls[0].address, MULTICALL3_ADDRESS);
        assert_eq!(plan.origins[0].address, NATIVE_TOKEN_ADDRESS);

        let custom = Address::repeat_byte(0x42);
        let plan = build_calls(
            1,
            &[TokenQuery::native(1)],
            Some(owner),
            None,
            &registry.with_multicall(1, custom),
        );
        assert_eq!(plan.calls[0].address, custom);
    }

    #[test]
    fn test_fresh_cache_entries_are_skipped() {
        let owner = Some(Address::repeat_byte(0xab));
        let cache = FreshnessCache::default();
        let query = TokenQuery::new(1, usdc());
        cache.insert(TokenRecord::from_query(&query), owner);

        let view = CacheView {
            cache: &cache,
            window: Duration::from_secs(60),
        };
        let plan = build_calls(1, &[query.clone()], owner, Some(view), &StaticChainRegistry::new());
        assert!(plan.is_empty());
        assert!(plan.cached.contains_key(&usdc()));

        // Another owner must not reuse the entry.
        let plan = build_calls(
            1,
            &[query],
            Some(Address::repeat_byte(0xcd)),
            Some(view),
            &StaticChainRegistry::new(),
        );
        assert_eq!(plan.calls.len(), 4);
    }

    #[test]
    fn test_encode_balance_of() {
        let owner = Address::repeat_byte(0x11);
        let call = encode_call(&BatchCall {
            address: usdc(),
            function: AbiFunction::BalanceOf,
            args: vec![Token::Address(owner)],
        })
        .unwrap();
        assert_eq!(call.target, usdc());
        // balanceOf(address) selector
        assert_eq!(&call.call_data[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(call.call_data.len(), 36);
    }

    #[test]
    fn test_encode_get_eth_balance() {
        let call = encode_call(&BatchCall {
            address: MULTICALL3_ADDRESS,
            function: AbiFunction::GetEthBalance,
            args: vec![Token::Address(Address::repeat_byte(0x11))],
        })
        .unwrap();
        assert_eq!(&call.call_data[..4], &[0x4d, 0x23, 0x01, 0xcc]);
    }
}
