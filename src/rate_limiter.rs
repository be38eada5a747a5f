//! Per-chain request queue: a bounded worker pool (`max_concurrent`) plus a
//! minimum interval between request starts (`delay`). Lanes are independent,
//! so a slow or throttled chain never delays another chain's requests.

use crate::chain_config::{ChainConfigRegistry, RateLimit};
use crate::error::BalanceError;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct ChainLane {
    semaphore: Arc<Semaphore>,
    /// `None` when the chain has no minimum spacing.
    gate: Option<DefaultDirectRateLimiter>,
    rate_limit: RateLimit,
}

impl ChainLane {
    fn new(rate_limit: RateLimit) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(rate_limit.max_concurrent.max(1))),
            gate: Quota::with_period(rate_limit.delay).map(RateLimiter::direct),
            rate_limit,
        }
    }
}

/// Slot in a chain's worker pool. Dropping it frees the slot.
pub struct ChainPermit {
    chain_id: u64,
    _permit: OwnedSemaphorePermit,
}

impl ChainPermit {
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

pub struct ChainQueue {
    lanes: DashMap<u64, Arc<ChainLane>>,
    config: Arc<ChainConfigRegistry>,
}

impl ChainQueue {
    pub fn new(config: Arc<ChainConfigRegistry>) -> Self {
        Self {
            lanes: DashMap::new(),
            config,
        }
    }

    fn lane(&self, chain_id: u64) -> Arc<ChainLane> {
        let lane = self
            .lanes
            .entry(chain_id)
            .or_insert_with(|| Arc::new(ChainLane::new(self.config.get_chain_rate_limit(chain_id))));
        Arc::clone(lane.value())
    }

    /// Waits for a free slot on the chain, then for the chain's start gate.
    ///
    /// The slot is taken first so that requests queued behind a full pool are
    /// still spaced out when they are released.
    pub async fn acquire(&self, chain_id: u64) -> Result<ChainPermit, BalanceError> {
        let lane = self.lane(chain_id);
        let permit = Arc::clone(&lane.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| BalanceError::transport(chain_id, e))?;
        if let Some(gate) = &lane.gate {
            gate.until_ready().await;
        }
        debug!(
            chain_id,
            in_flight = lane
                .rate_limit
                .max_concurrent
                .saturating_sub(lane.semaphore.available_permits()),
            "chain queue dispatch"
        );
        Ok(ChainPermit {
            chain_id,
            _permit: permit,
        })
    }

    /// Runs `task` inside one of the chain's slots.
    pub async fn run<F, Fut, T>(&self, chain_id: u64, task: F) -> Result<T, BalanceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BalanceError>>,
    {
        let _permit = self.acquire(chain_id).await?;
        task().await
    }

    pub fn rate_limit(&self, chain_id: u64) -> RateLimit {
        self.lane(chain_id).rate_limit
    }

    /// Requests currently holding a slot on the chain.
    pub fn in_flight(&self, chain_id: u64) -> usize {
        self.lanes.get(&chain_id).map_or(0, |lane| {
            lane.rate_limit
                .max_concurrent
                .max(1)
                .saturating_sub(lane.semaphore.available_permits())
        })
    }
}
