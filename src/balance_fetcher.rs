//! Single-chain balance fetch: cache-aware planning, one batched call, decode,
//! cache write-back.

use crate::batch_builder::{build_calls, decode_output, encode_call, CacheView};
use crate::cache::FreshnessCache;
use crate::chain_config::ChainConfigRegistry;
use crate::chain_registry::ChainRegistry;
use crate::error::BalanceError;
use crate::multicall::{CallOutcome, MulticallTransport};
use crate::types::conversions::address_to_string;
use crate::types::{
    AbiFunction, Balance, BatchCall, TokenQuery, TokenRecord, DEFAULT_DECIMALS,
    NATIVE_TOKEN_ADDRESS,
};
use ethers::abi::Token;
use ethers::types::{Address, U256};
use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub type TokenRecords = HashMap<Address, TokenRecord>;

/// Stable key for an external query cache: scoped by chain, owner and the
/// exact set of requested addresses (order and duplicates do not matter).
pub fn balances_query_key(chain_id: u64, owner: Option<Address>, addresses: &[Address]) -> String {
    let set: BTreeSet<String> = addresses.iter().map(|a| address_to_string(*a)).collect();
    let owner = owner.map(address_to_string).unwrap_or_else(|| "none".to_string());
    format!(
        "getBalances/{}/{}/{}",
        chain_id,
        owner,
        set.into_iter().collect::<Vec<_>>().join(",")
    )
}

#[derive(Clone)]
pub struct BalanceFetcher {
    transport: Arc<dyn MulticallTransport>,
    registry: Arc<dyn ChainRegistry>,
    cache: Arc<FreshnessCache>,
    chain_config: Arc<ChainConfigRegistry>,
}

impl BalanceFetcher {
    pub fn new(
        transport: Arc<dyn MulticallTransport>,
        registry: Arc<dyn ChainRegistry>,
        cache: Arc<FreshnessCache>,
        chain_config: Arc<ChainConfigRegistry>,
    ) -> Self {
        Self {
            transport,
            registry,
            cache,
            chain_config,
        }
    }

    pub fn cache(&self) -> &Arc<FreshnessCache> {
        &self.cache
    }

    pub fn chain_config(&self) -> &Arc<ChainConfigRegistry> {
        &self.chain_config
    }

    /// Balances for `tokens` on one chain. Fresh, owner-matching cache entries
    /// are served without any contract read unless `force_fetch` is set; the
    /// rest go out in a single batched call. Fresh results win over cached ones.
    pub async fn get_balances(
        &self,
        chain_id: u64,
        owner: Option<Address>,
        tokens: &[TokenQuery],
        force_fetch: bool,
    ) -> Result<TokenRecords, BalanceError> {
        let view = CacheView {
            cache: &self.cache,
            window: self
                .chain_config
                .stale_time_override(chain_id)
                .unwrap_or_else(|| self.cache.freshness_window()),
        };
        let plan = build_calls(
            chain_id,
            tokens,
            owner,
            if force_fetch { None } else { Some(view) },
            self.registry.as_ref(),
        );

        let mut records = plan.cached;
        if !plan.calls.is_empty() {
            let fresh = self
                .perform_call(chain_id, &plan.calls, &plan.origins, owner)
                .await?;
            records.extend(fresh);
        }

        // Tokens that needed no read at all (every field hinted, no owner).
        for token in tokens {
            if !records.contains_key(&token.address) {
                let mut record = self.seed_record(token);
                record.decimals = record.resolved_decimals();
                let stored = self.cache.insert(record, owner);
                records.insert(token.address, stored);
            }
        }
        Ok(records)
    }

    /// Issues exactly one batched request for `calls` and decodes the results
    /// into records keyed by token address, writing each into the cache.
    ///
    /// Fails only when the batch as a whole fails. A single field that does not
    /// decode falls back to its default (decimals 18, empty string, zero).
    pub async fn perform_call(
        &self,
        chain_id: u64,
        calls: &[BatchCall],
        origins: &[TokenQuery],
        owner: Option<Address>,
    ) -> Result<TokenRecords, BalanceError> {
        if calls.is_empty() {
            return Ok(TokenRecords::new());
        }
        let encoded = calls.iter().map(encode_call).collect::<Result<Vec<_>, _>>()?;
        let outcomes = self.transport.aggregate(chain_id, encoded).await?;
        if outcomes.len() != calls.len() {
            return Err(BalanceError::transport(
                chain_id,
                format!("expected {} results, got {}", calls.len(), outcomes.len()),
            ));
        }

        let mut records: TokenRecords = HashMap::new();
        let mut raw_balances: HashMap<Address, U256> = HashMap::new();

        for ((call, origin), outcome) in calls.iter().zip(origins).zip(&outcomes) {
            let token = if call.function == AbiFunction::GetEthBalance {
                NATIVE_TOKEN_ADDRESS
            } else {
                origin.address
            };
            let record = records
                .entry(token)
                .or_insert_with(|| self.seed_record(origin));

            match call.function {
                AbiFunction::Name | AbiFunction::Symbol if record.is_native() => {}
                AbiFunction::Name => record.name = decode_string(call.function, outcome),
                AbiFunction::Symbol => record.symbol = decode_string(call.function, outcome),
                AbiFunction::Decimals => record.decimals = decode_decimals(outcome),
                AbiFunction::BalanceOf | AbiFunction::GetEthBalance => {
                    raw_balances.insert(token, decode_uint(call.function, outcome));
                }
            }
        }

        let mut resolved = TokenRecords::with_capacity(records.len());
        for (address, mut record) in records {
            record.decimals = record.resolved_decimals();
            if let Some(raw) = raw_balances.get(&address) {
                record.balance = Balance::new(*raw, record.decimals);
            }
            let stored = self.cache.insert(record, owner);
            resolved.insert(address, stored);
        }
        debug!(
            "chain {}: decoded {} records from {} calls",
            chain_id,
            resolved.len(),
            calls.len()
        );
        Ok(resolved)
    }

    fn seed_record(&self, query: &TokenQuery) -> TokenRecord {
        let mut record = TokenRecord::from_query(query);
        if query.is_native() {
            record.address = NATIVE_TOKEN_ADDRESS;
            if let Some(native) = self.registry.native_currency(query.chain_id) {
                record.name = native.name;
                record.symbol = native.symbol;
                record.decimals = native.decimals;
            }
        }
        record
    }
}

// 10^77 is the largest power of ten a uint256 holds.
const MAX_DECIMALS: u8 = 77;

fn decode_decimals(outcome: &CallOutcome) -> u8 {
    if !outcome.success {
        return DEFAULT_DECIMALS;
    }
    let decimals = decode_output(AbiFunction::Decimals, &outcome.return_data)
        .and_then(|v| v.into_iter().next())
        .and_then(Token::into_uint)
        .filter(|u| *u <= U256::from(MAX_DECIMALS))
        .map(|u| u.low_u64() as u8);
    match decimals {
        Some(d) if d != 0 => d,
        // Legitimate 0-decimal tokens are indistinguishable from a failed read here.
        _ => DEFAULT_DECIMALS,
    }
}

fn decode_uint(function: AbiFunction, outcome: &CallOutcome) -> U256 {
    if !outcome.success {
        debug!("{} reverted, using zero", function.as_str());
        return U256::zero();
    }
    decode_output(function, &outcome.return_data)
        .and_then(|v| v.into_iter().next())
        .and_then(Token::into_uint)
        .unwrap_or_default()
}

fn decode_string(function: AbiFunction, outcome: &CallOutcome) -> String {
    if !outcome.success {
        return String::new();
    }
    if let Some(s) = decode_output(function, &outcome.return_data)
        .and_then(|v| v.into_iter().next())
        .and_then(Token::into_string)
    {
        return s;
    }
    // Legacy tokens (MKR, SAI) return bytes32 instead of string.
    decode_bytes32_string(&outcome.return_data).unwrap_or_else(|| {
        debug!("{} did not decode as string or bytes32", function.as_str());
        String::new()
    })
}

fn decode_bytes32_string(data: &[u8]) -> Option<String> {
    if data.len() != 32 {
        return None;
    }
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    std::str::from_utf8(&data[..end]).ok().map(str::to_string)
}
