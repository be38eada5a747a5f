use thiserror::Error;

/// Errors surfaced by the balance engine. All of them are scoped to one chain
/// except `Config`.
///
/// Field-level decode anomalies and owner mismatches on cache hits are not
/// errors: the former default silently, the latter count as cache misses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BalanceError {
    #[error("batched call failed on chain {chain_id}: {message}")]
    Transport { chain_id: u64, message: String },
    #[error("no RPC endpoint configured for chain {chain_id}")]
    MissingRpc { chain_id: u64 },
    #[error("chain {chain_id} is not known to the registry")]
    UnknownChain { chain_id: u64 },
    #[error("ABI encoding failed: {0}")]
    Abi(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl BalanceError {
    pub fn transport(chain_id: u64, err: impl std::fmt::Display) -> Self {
        BalanceError::Transport {
            chain_id,
            message: err.to_string(),
        }
    }

    pub fn chain_id(&self) -> Option<u64> {
        match self {
            BalanceError::Transport { chain_id, .. }
            | BalanceError::MissingRpc { chain_id }
            | BalanceError::UnknownChain { chain_id } => Some(*chain_id),
            BalanceError::Abi(_) | BalanceError::Config(_) => None,
        }
    }

    /// Whether another attempt could succeed. Only transport failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BalanceError::Transport { .. })
    }
}

impl From<config::ConfigError> for BalanceError {
    fn from(err: config::ConfigError) -> Self {
        BalanceError::Config(err.to_string())
    }
}
