use crate::chain_registry::ChainRegistry;
use crate::error::BalanceError;
use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use log::debug;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// A single RPC call to be batched in a multicall.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    /// Target contract address
    pub target: Address,
    /// Encoded function call data
    pub call_data: Bytes,
}

/// Per-call result of a batch. `success == false` means the inner call
/// reverted; `return_data` then holds the revert payload, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub success: bool,
    pub return_data: Bytes,
}

impl CallOutcome {
    pub fn ok(return_data: impl Into<Bytes>) -> Self {
        Self {
            success: true,
            return_data: return_data.into(),
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            return_data: Bytes::new(),
        }
    }
}

/// Batched multi-contract-call primitive: one network round trip per
/// invocation, N contract reads, one outcome per read in input order.
///
/// Implementations must fail the whole batch on transport errors and never
/// return a result vector whose length differs from `calls`.
#[async_trait]
pub trait MulticallTransport: Send + Sync {
    async fn aggregate(
        &self,
        chain_id: u64,
        calls: Vec<Call>,
    ) -> Result<Vec<CallOutcome>, BalanceError>;
}

// function aggregate3(Call3[] calldata calls) public payable returns (Result[] memory returnData)
// Call3 struct: { target, allowFailure, callData }
// Result struct: { success, returnData }
#[allow(deprecated)]
static AGGREGATE3: Lazy<Function> = Lazy::new(|| {
    Function {
        name: "aggregate3".to_string(),
        inputs: vec![Param {
            name: "calls".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Address,
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        outputs: vec![Param {
            name: "returnData".to_string(),
            kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Bool,
                ParamType::Bytes,
            ]))),
            internal_type: None,
        }],
        constant: None,
        state_mutability: StateMutability::Payable,
    }
});

/// Multicall3 `aggregate3` executor for one chain.
///
/// Identical `(target, calldata)` pairs are coalesced before sending and
/// fanned back out afterwards, so callers may submit duplicates freely.
#[derive(Clone)]
pub struct Multicall<M: Middleware> {
    pub provider: Arc<M>,
    multicall_address: Address,
}

impl<M: Middleware + 'static> Multicall<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address) -> Self {
        Self {
            provider,
            multicall_address,
        }
    }

    /// Runs all calls in exactly one `eth_call`, optionally at a specific block.
    pub async fn run(
        &self,
        calls: Vec<Call>,
        block: Option<BlockId>,
    ) -> anyhow::Result<Vec<CallOutcome>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        // Coalesce identical calls to reduce load
        let mut unique_calls = indexmap::IndexSet::new();
        let mut original_indices = Vec::with_capacity(calls.len());
        for call in &calls {
            let (index, _) = unique_calls.insert_full((call.target, call.call_data.clone()));
            original_indices.push(index);
        }
        debug!(
            "Multicall coalesced {} calls into {}",
            calls.len(),
            unique_calls.len()
        );

        let unique: Vec<Call> = unique_calls
            .into_iter()
            .map(|(target, call_data)| Call { target, call_data })
            .collect();
        let results = self.execute_multicall3(&unique, block).await?;
        if results.len() != unique.len() {
            anyhow::bail!(
                "aggregate3 returned {} results for {} calls",
                results.len(),
                unique.len()
            );
        }

        // Reconstruct the full result set in the original order
        original_indices
            .into_iter()
            .map(|index| {
                results
                    .get(index)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("missing aggregate3 result {}", index))
            })
            .collect()
    }

    async fn execute_multicall3(
        &self,
        calls: &[Call],
        block: Option<BlockId>,
    ) -> anyhow::Result<Vec<CallOutcome>> {
        let call_tokens = calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(true), // allowFailure = true
                    Token::Bytes(call.call_data.to_vec()),
                ])
            })
            .collect();

        let calldata = AGGREGATE3.encode_input(&[Token::Array(call_tokens)])?;
        let tx_request = TransactionRequest::new()
            .to(self.multicall_address)
            .data(calldata);
        let typed_tx: ethers::types::transaction::eip2718::TypedTransaction = tx_request.into();

        // No timeout here: the provider's HTTP client owns it.
        let response = self
            .provider
            .call(&typed_tx, block)
            .await
            .map_err(|e| anyhow::anyhow!("eth_call failed: {}", e))?;

        let decoded = AGGREGATE3.decode_output(&response)?;
        let results_array = decoded
            .into_iter()
            .next()
            .and_then(|t| t.into_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid multicall response format"))?;

        let mut outcomes = Vec::with_capacity(results_array.len());
        for result_token in results_array {
            let Token::Tuple(tuple) = result_token else {
                anyhow::bail!("aggregate3 result is not a tuple");
            };
            let mut fields = tuple.into_iter();
            let success = fields.next().and_then(|t| t.into_bool()).unwrap_or(false);
            let data = fields.next().and_then(|t| t.into_bytes()).unwrap_or_default();
            outcomes.push(CallOutcome {
                success,
                return_data: Bytes::from(data),
            });
        }

        Ok(outcomes)
    }
}

/// HTTP-backed transport: one `Multicall` per chain, built lazily from the
/// chain registry's RPC endpoint and aggregate contract.
pub struct EthersMulticall {
    registry: Arc<dyn ChainRegistry>,
    clients: DashMap<u64, Arc<Multicall<Provider<Http>>>>,
}

impl EthersMulticall {
    pub fn new(registry: Arc<dyn ChainRegistry>) -> Self {
        Self {
            registry,
            clients: DashMap::new(),
        }
    }

    fn client(&self, chain_id: u64) -> Result<Arc<Multicall<Provider<Http>>>, BalanceError> {
        if let Some(client) = self.clients.get(&chain_id) {
            return Ok(Arc::clone(client.value()));
        }
        let url = self
            .registry
            .rpc_url(chain_id)
            .ok_or(BalanceError::MissingRpc { chain_id })?;
        let provider = Provider::<Http>::try_from(url.as_str())
            .map_err(|e| BalanceError::Config(format!("bad RPC url for chain {}: {}", chain_id, e)))?;
        let client = Arc::new(Multicall::new(
            Arc::new(provider),
            self.registry.aggregate_contract(chain_id),
        ));
        self.clients.insert(chain_id, Arc::clone(&client));
        Ok(client)
    }
}

#[async_trait]
impl MulticallTransport for EthersMulticall {
    async fn aggregate(
        &self,
        chain_id: u64,
        calls: Vec<Call>,
    ) -> Result<Vec<CallOutcome>, BalanceError> {
        let client = self.client(chain_id)?;
        metrics::increment_multicall_batches(chain_id);
        metrics::record_multicall_batch_size(calls.len() as f64);
        client
            .run(calls, None)
            .await
            .map_err(|e| BalanceError::transport(chain_id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_registry::StaticChainRegistry;

    #[test]
    fn test_aggregate3_selector() {
        // keccak("aggregate3((address,bool,bytes)[])")[..4]
        assert_eq!(AGGREGATE3.short_signature(), [0x82, 0xad, 0x56, 0xcb]);
    }

    #[test]
    fn test_aggregate3_output_decoding() {
        let encoded = ethers::abi::encode(&[Token::Array(vec![
            Token::Tuple(vec![Token::Bool(true), Token::Bytes(vec![1, 2, 3])]),
            Token::Tuple(vec![Token::Bool(false), Token::Bytes(vec![])]),
        ])]);
        let decoded = AGGREGATE3.decode_output(&encoded).unwrap();
        let items = decoded[0].clone().into_array().unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_rpc_is_reported_per_chain() {
        let transport = EthersMulticall::new(Arc::new(StaticChainRegistry::new()));
        let err = transport
            .aggregate(
                777,
                vec![Call {
                    target: Address::zero(),
                    call_data: Bytes::new(),
                }],
            )
            .await
            .unwrap_err();
        assert_eq!(err, BalanceError::MissingRpc { chain_id: 777 });
    }
}
