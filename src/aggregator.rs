//! Multi-chain balance aggregator.
//!
//! Groups token queries by chain, fetches every chain through its rate-limited
//! queue in fixed-size chunks, and publishes results as whole-map snapshots.
//!
//! ## Invocation generations
//!
//! Every full refresh takes the next generation number. A chain's results are
//! committed to the published map only while that generation is still the
//! current one; once a newer refresh (or an owner change) has started, the older
//! invocation keeps running to completion but everything it produces afterwards
//! is dropped. Nothing in flight is aborted.
//!
//! ## Status
//!
//! Each chain touched by the current refresh goes `loading` and then exactly
//! one of `success`/`error`, set together with the commit of its data. A chain
//! left `loading` by a superseded refresh loses its status entry when the newer
//! refresh does not cover it. Partial refreshes never touch status flags.

use crate::balance_fetcher::{BalanceFetcher, TokenRecords};
use crate::cache::FreshnessCache;
use crate::chain_config::ChainConfigRegistry;
use crate::chain_registry::ChainRegistry;
use crate::error::BalanceError;
use crate::metrics;
use crate::multicall::MulticallTransport;
use crate::rate_limiter::ChainQueue;
use crate::settings::{RetrySettings, Settings};
use crate::types::{ChainBalanceMap, ChainStatus, TokenQuery};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use ethers::types::Address;
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

/// Outcome of one refresh call.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub generation: u64,
    /// Chains whose results reached the published map, in commit order.
    pub committed: Vec<u64>,
    pub failed: HashMap<u64, BalanceError>,
    /// True when a newer invocation or an owner change made this one stale.
    pub superseded: bool,
}

impl RefreshReport {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    /// First chain error, lowest chain ID first.
    pub fn error(&self) -> Option<&BalanceError> {
        self.failed
            .iter()
            .min_by_key(|(chain, _)| **chain)
            .map(|(_, e)| e)
    }

    pub fn is_ok(&self) -> bool {
        self.failed.is_empty() && !self.superseded
    }
}

pub struct BalanceAggregator {
    fetcher: BalanceFetcher,
    queue: Arc<ChainQueue>,
    chunk_size: usize,
    retry: RetrySettings,
    priority_chain: RwLock<Option<u64>>,

    owner: RwLock<Option<Address>>,
    tokens: RwLock<Vec<TokenQuery>>,
    prices: RwLock<HashMap<(u64, Address), f64>>,

    generation: AtomicU64,
    owner_epoch: AtomicU64,
    /// Serialises the generation check with the publish it guards.
    commit_lock: Mutex<()>,
    data: ArcSwap<ChainBalanceMap>,
    statuses: DashMap<u64, ChainStatus>,
    last_error: RwLock<Option<BalanceError>>,
}

impl BalanceAggregator {
    pub fn new(fetcher: BalanceFetcher, queue: Arc<ChainQueue>, settings: &Settings) -> Self {
        Self {
            fetcher,
            queue,
            chunk_size: settings.aggregator.chunk_size.max(1),
            retry: settings.retry.clone(),
            priority_chain: RwLock::new(settings.aggregator.priority_chain),
            owner: RwLock::new(None),
            tokens: RwLock::new(Vec::new()),
            prices: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            owner_epoch: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            data: ArcSwap::from_pointee(ChainBalanceMap::new()),
            statuses: DashMap::new(),
            last_error: RwLock::new(None),
        }
    }

    /// Wires cache, chain config, queue and fetcher from settings around a transport.
    pub fn from_settings(
        transport: Arc<dyn MulticallTransport>,
        registry: Arc<dyn ChainRegistry>,
        settings: &Settings,
    ) -> Self {
        let chain_config = Arc::new(ChainConfigRegistry::from_settings(settings));
        let cache = Arc::new(FreshnessCache::from_settings(settings));
        let queue = Arc::new(ChainQueue::new(Arc::clone(&chain_config)));
        let fetcher = BalanceFetcher::new(transport, registry, cache, chain_config);
        Self::new(fetcher, queue, settings)
    }

    // --- inputs ---

    pub fn set_tokens(&self, tokens: Vec<TokenQuery>) {
        *write(&self.tokens) = tokens;
    }

    pub fn tokens(&self) -> Vec<TokenQuery> {
        read(&self.tokens).clone()
    }

    pub fn set_priority_chain(&self, chain_id: Option<u64>) {
        *write(&self.priority_chain) = chain_id;
    }

    /// USD prices applied to records as they are committed.
    pub fn set_prices(&self, prices: HashMap<(u64, Address), f64>) {
        *write(&self.prices) = prices;
    }

    pub fn owner(&self) -> Option<Address> {
        *read(&self.owner)
    }

    /// Switches wallet. The published map and every in-flight refresh are
    /// discarded and all known chains go back to `loading`.
    pub fn set_owner(&self, owner: Option<Address>) {
        if self.owner() == owner {
            return;
        }
        let _guard = lock(&self.commit_lock);
        *write(&self.owner) = owner;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.owner_epoch.fetch_add(1, Ordering::SeqCst);
        self.data.store(Arc::new(ChainBalanceMap::new()));

        let mut chains: Vec<u64> = self.statuses.iter().map(|e| *e.key()).collect();
        chains.extend(read(&self.tokens).iter().map(|t| t.chain_id));
        for chain_id in chains {
            self.statuses.insert(chain_id, ChainStatus::loading());
        }
        *write(&self.last_error) = None;
        info!("Owner changed to {:?}, balance map reset", owner);
    }

    // --- outputs ---

    /// Current published snapshot. Never partially updated.
    pub fn data(&self) -> Arc<ChainBalanceMap> {
        self.data.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn chain_status(&self, chain_id: u64) -> Option<ChainStatus> {
        self.statuses.get(&chain_id).map(|s| *s)
    }

    pub fn chain_loading_status(&self) -> HashMap<u64, bool> {
        self.status_map(|s| s.loading)
    }

    pub fn chain_success_status(&self) -> HashMap<u64, bool> {
        self.status_map(|s| s.success)
    }

    pub fn chain_error_status(&self) -> HashMap<u64, bool> {
        self.status_map(|s| s.error)
    }

    pub fn is_loading(&self) -> bool {
        self.statuses.iter().any(|s| s.loading)
    }

    pub fn is_success(&self) -> bool {
        !self.statuses.is_empty() && self.statuses.iter().all(|s| s.success)
    }

    pub fn is_error(&self) -> bool {
        self.statuses.iter().any(|s| s.error)
    }

    /// Most recent chain error of the current owner's refreshes.
    pub fn error(&self) -> Option<BalanceError> {
        read(&self.last_error).clone()
    }

    fn status_map(&self, field: impl Fn(&ChainStatus) -> bool) -> HashMap<u64, bool> {
        self.statuses
            .iter()
            .map(|e| (*e.key(), field(e.value())))
            .collect()
    }

    // --- refreshes ---

    /// Full refresh of every configured token. The priority chain, if any, is
    /// fetched and committed before the remaining chains start.
    pub async fn on_update(&self, force_fetch: bool) -> RefreshReport {
        let started = Instant::now();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let owner = self.owner();
        let mut report = RefreshReport::new(generation);

        let mut by_chain = group_by_chain(&read(&self.tokens));
        {
            let _guard = lock(&self.commit_lock);
            if self.is_current(generation) {
                // Chains still loading for an older refresh are no longer
                // tracked by anyone once this refresh leaves them out.
                self.statuses.retain(|chain_id, status| {
                    by_chain.contains_key(chain_id) || !status.loading
                });
                for chain_id in by_chain.keys() {
                    self.statuses.insert(*chain_id, ChainStatus::loading());
                }
                *write(&self.last_error) = None;
            }
        }
        if by_chain.is_empty() {
            return report;
        }
        info!(
            "Refresh #{}: {} chains, owner {:?}, force={}",
            generation,
            by_chain.len(),
            owner,
            force_fetch
        );

        let priority = *read(&self.priority_chain);
        if let Some(chain_id) = priority {
            if let Some(tokens) = by_chain.shift_remove(&chain_id) {
                let result = self.fetch_chain(chain_id, &tokens, owner, force_fetch).await;
                self.finish_chain(generation, chain_id, result, &mut report);
            }
        }

        let mut in_flight: FuturesUnordered<_> = by_chain
            .into_iter()
            .map(|(chain_id, tokens)| async move {
                let result = self.fetch_chain(chain_id, &tokens, owner, force_fetch).await;
                (chain_id, result)
            })
            .collect();
        while let Some((chain_id, result)) = in_flight.next().await {
            self.finish_chain(generation, chain_id, result, &mut report);
        }

        if report.superseded {
            metrics::increment_refresh_superseded();
            info!(
                "Refresh #{} superseded by #{}, late results discarded",
                generation,
                self.generation()
            );
        }
        let config = Arc::clone(self.fetcher.chain_config());
        self.fetcher
            .cache()
            .purge_expired(|chain_id| config.get_chain_cache_config(chain_id).gc_time);

        metrics::record_refresh_duration(started.elapsed());
        info!(
            "Refresh #{} done in {:?}: {} committed, {} failed",
            generation,
            started.elapsed(),
            report.committed.len(),
            report.failed.len()
        );
        report
    }

    /// Fetches and merges an explicit subset of tokens. Other chains' in-flight
    /// work and every status flag are left alone; results are dropped if the
    /// owner changes before they arrive.
    pub async fn on_update_some(&self, tokens: &[TokenQuery], force_fetch: bool) -> RefreshReport {
        let epoch = self.owner_epoch.load(Ordering::SeqCst);
        let owner = self.owner();
        let mut report = RefreshReport::new(self.generation());

        let mut in_flight: FuturesUnordered<_> = group_by_chain(tokens)
            .into_iter()
            .map(|(chain_id, tokens)| async move {
                let result = self.fetch_chain(chain_id, &tokens, owner, force_fetch).await;
                (chain_id, result)
            })
            .collect();

        while let Some((chain_id, result)) = in_flight.next().await {
            let _guard = lock(&self.commit_lock);
            if self.owner_epoch.load(Ordering::SeqCst) != epoch {
                report.superseded = true;
                continue;
            }
            match result {
                Ok(records) => {
                    self.publish(chain_id, records);
                    report.committed.push(chain_id);
                }
                Err(e) => {
                    warn!("Partial refresh failed on chain {}: {}", chain_id, e);
                    *write(&self.last_error) = Some(e.clone());
                    report.failed.insert(chain_id, e);
                }
            }
        }
        report
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn finish_chain(
        &self,
        generation: u64,
        chain_id: u64,
        result: Result<TokenRecords, BalanceError>,
        report: &mut RefreshReport,
    ) {
        let _guard = lock(&self.commit_lock);
        if !self.is_current(generation) {
            debug!(
                "Dropping chain {} results of stale refresh #{}",
                chain_id, generation
            );
            report.superseded = true;
            return;
        }
        match result {
            Ok(records) => {
                self.publish(chain_id, records);
                self.set_terminal(chain_id, ChainStatus::succeeded());
                report.committed.push(chain_id);
            }
            Err(e) => {
                // Last known values for the chain stay published.
                warn!("Chain {} refresh failed: {}", chain_id, e);
                self.set_terminal(chain_id, ChainStatus::failed());
                *write(&self.last_error) = Some(e.clone());
                report.failed.insert(chain_id, e);
            }
        }
    }

    fn set_terminal(&self, chain_id: u64, status: ChainStatus) {
        let mut entry = self.statuses.entry(chain_id).or_insert_with(ChainStatus::loading);
        if !entry.is_terminal() {
            *entry = status;
        }
    }

    /// Swaps in a new snapshot with `records` merged into the chain's entry.
    /// Callers hold `commit_lock`.
    fn publish(&self, chain_id: u64, records: TokenRecords) {
        let prices = read(&self.prices);
        let mut next = ChainBalanceMap::clone(&self.data.load());
        let chain = next.entry(chain_id).or_default();
        for (address, record) in records {
            let record = match prices.get(&(chain_id, address)) {
                Some(price) => record.with_price(*price),
                None => record,
            };
            chain.insert(address, record);
        }
        self.data.store(Arc::new(next));
    }

    /// All chunks of one chain, up to `max_concurrent` at a time. The chain
    /// fails as a whole if any chunk still fails after retries.
    async fn fetch_chain(
        &self,
        chain_id: u64,
        tokens: &[TokenQuery],
        owner: Option<Address>,
        force_fetch: bool,
    ) -> Result<TokenRecords, BalanceError> {
        let limit = self.queue.rate_limit(chain_id).max_concurrent.max(1);
        let chunks: Vec<Vec<TokenQuery>> =
            tokens.chunks(self.chunk_size).map(|c| c.to_vec()).collect();
        debug!(
            "chain {}: {} tokens in {} chunks (max {} in flight)",
            chain_id,
            tokens.len(),
            chunks.len(),
            limit
        );

        let results: Vec<Result<TokenRecords, BalanceError>> = futures::stream::iter(chunks)
            .map(|chunk| async move { self.fetch_chunk(chain_id, chunk, owner, force_fetch).await })
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut pending = TokenRecords::with_capacity(tokens.len());
        for result in results {
            match result {
                Ok(records) => pending.extend(records),
                Err(e) => {
                    metrics::increment_chain_fetch_failed(chain_id);
                    return Err(e);
                }
            }
        }
        Ok(pending)
    }

    async fn fetch_chunk(
        &self,
        chain_id: u64,
        chunk: Vec<TokenQuery>,
        owner: Option<Address>,
        force_fetch: bool,
    ) -> Result<TokenRecords, BalanceError> {
        let action = || {
            let chunk = &chunk;
            async move {
                self.queue
                    .run(chain_id, || {
                        self.fetcher.get_balances(chain_id, owner, chunk, force_fetch)
                    })
                    .await
            }
        };
        let should_retry = |e: &BalanceError| {
            let retry = e.is_retryable();
            if retry {
                warn!("Chunk fetch failed on chain {}: {}", chain_id, e);
            }
            retry
        };
        RetryIf::spawn(self.retry_strategy(), action, should_retry).await
    }

    /// 1s, 2s, 4s, ... capped at `max_delay_ms`, at most `max_retries` times.
    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor((self.retry.base_delay_ms / 2).max(1))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .take(self.retry.max_retries)
    }
}

/// Dedupes by address within each chain, keeping first-seen order.
fn group_by_chain(tokens: &[TokenQuery]) -> IndexMap<u64, Vec<TokenQuery>> {
    let mut grouped: IndexMap<u64, IndexMap<Address, TokenQuery>> = IndexMap::new();
    for token in tokens {
        grouped
            .entry(token.chain_id)
            .or_default()
            .entry(token.address)
            .or_insert_with(|| token.clone());
    }
    grouped
        .into_iter()
        .map(|(chain_id, tokens)| (chain_id, tokens.into_values().collect()))
        .collect()
}

// Poisoning only happens if a holder panicked; the guarded data is still valid.
fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
