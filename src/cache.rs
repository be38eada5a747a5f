use crate::metrics;
use crate::settings::Settings;
use crate::types::conversions::address_to_string;
use crate::types::TokenRecord;
use dashmap::DashMap;
use ethers::types::Address;
use log::{debug, trace};
use std::time::Duration;
use tokio::time::Instant;

const CACHE_NAME: &str = "token_balance";

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: TokenRecord,
    /// Wallet the balance was read for; `None` when fetched without an owner.
    pub owner: Option<Address>,
    pub last_update: Instant,
}

impl CacheEntry {
    /// Usable without refetching iff younger than `window` and read for `owner`.
    pub fn is_fresh_for(&self, owner: Option<Address>, window: Duration, now: Instant) -> bool {
        self.owner == owner && now.saturating_duration_since(self.last_update) < window
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Fresh(TokenRecord),
    Stale,
    /// Entry exists but belongs to another wallet. Treated as a miss.
    OwnerMismatch,
    Miss,
}

/// Process-wide last-known token records keyed by `"{chainID}/{address}"`.
///
/// Entries are never deleted on read; they age out through the timestamp check
/// and are physically dropped by [`FreshnessCache::purge_expired`] or by
/// size-based eviction of the oldest entries.
///
/// Concurrent writers for the same key are resolved by timestamp: a write
/// stamped earlier than the stored entry is ignored.
#[derive(Debug)]
pub struct FreshnessCache {
    entries: DashMap<String, CacheEntry>,
    freshness_window: Duration,
    max_entries: usize,
}

impl Default for FreshnessCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 10_000)
    }
}

impl FreshnessCache {
    pub fn new(freshness_window: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            freshness_window,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Duration::from_millis(settings.cache.freshness_window_ms),
            settings.cache.max_entries,
        )
    }

    pub fn key(chain_id: u64, address: Address) -> String {
        format!("{}/{}", chain_id, address_to_string(address))
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    pub fn lookup(&self, chain_id: u64, address: Address, owner: Option<Address>) -> CacheLookup {
        self.lookup_within(chain_id, address, owner, self.freshness_window, Instant::now())
    }

    pub fn lookup_within(
        &self,
        chain_id: u64,
        address: Address,
        owner: Option<Address>,
        window: Duration,
        now: Instant,
    ) -> CacheLookup {
        let result = match self.entries.get(&Self::key(chain_id, address)) {
            None => CacheLookup::Miss,
            Some(entry) if entry.owner != owner => CacheLookup::OwnerMismatch,
            Some(entry) if entry.is_fresh_for(owner, window, now) => {
                CacheLookup::Fresh(entry.record.clone())
            }
            Some(_) => CacheLookup::Stale,
        };

        match &result {
            CacheLookup::Fresh(_) => metrics::increment_cache_hit(CACHE_NAME),
            CacheLookup::OwnerMismatch => {
                trace!("cache owner mismatch for {}/{:?}", chain_id, address);
                metrics::increment_cache_miss(CACHE_NAME);
            }
            _ => metrics::increment_cache_miss(CACHE_NAME),
        }
        result
    }

    /// Shorthand for a fresh, owner-matching record.
    pub fn get_fresh(
        &self,
        chain_id: u64,
        address: Address,
        owner: Option<Address>,
        window: Duration,
    ) -> Option<TokenRecord> {
        match self.lookup_within(chain_id, address, owner, window, Instant::now()) {
            CacheLookup::Fresh(record) => Some(record),
            _ => None,
        }
    }

    /// Raw entry regardless of age or owner.
    pub fn get(&self, chain_id: u64, address: Address) -> Option<CacheEntry> {
        self.entries
            .get(&Self::key(chain_id, address))
            .map(|e| e.value().clone())
    }

    pub fn insert(&self, record: TokenRecord, owner: Option<Address>) -> TokenRecord {
        self.insert_at(record, owner, Instant::now())
    }

    /// Stores a freshly decoded record and returns what the cache now holds.
    ///
    /// An existing record for the key is merged into (metadata kept, balance
    /// overwritten) rather than replaced.
    pub fn insert_at(&self, record: TokenRecord, owner: Option<Address>, at: Instant) -> TokenRecord {
        let key = Self::key(record.chain_id, record.address);
        let stored = {
            let mut slot = self.entries.entry(key).or_insert_with(|| CacheEntry {
                record: record.clone(),
                owner,
                last_update: at,
            });
            if slot.last_update <= at {
                if slot.owner != owner {
                    // USD value belongs to the previous wallet's balance.
                    slot.record.value = None;
                }
                slot.record.merge_from(&record);
                slot.owner = owner;
                slot.last_update = at;
            }
            slot.record.clone()
        };
        self.maybe_evict();
        stored
    }

    /// Drops entries older than their chain's gc time.
    pub fn purge_expired(&self, gc_time_for: impl Fn(u64) -> Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            now.saturating_duration_since(entry.last_update) < gc_time_for(entry.record.chain_id)
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Purged {} expired balance cache entries", removed);
        }
        metrics::set_cache_size(CACHE_NAME, self.entries.len() as f64);
        removed
    }

    fn maybe_evict(&self) {
        let len = self.entries.len();
        if len <= self.max_entries {
            return;
        }
        let mut by_age: Vec<(Instant, String)> = self
            .entries
            .iter()
            .map(|e| (e.last_update, e.key().clone()))
            .collect();
        by_age.sort_by_key(|(at, _)| *at);

        let to_remove = len - self.max_entries;
        for (_, key) in by_age.into_iter().take(to_remove) {
            self.entries.remove(&key);
        }
        debug!(
            "Evicted {} entries from balance cache (size: {})",
            to_remove,
            self.entries.len()
        );
        metrics::set_cache_size(CACHE_NAME, self.entries.len() as f64);
    }

    pub fn clear(&self) {
        self.entries.clear();
        metrics::set_cache_size(CACHE_NAME, 0.0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Balance, TokenQuery};
    use ethers::types::U256;

    fn record(chain_id: u64, byte: u8, raw: u64) -> TokenRecord {
        let mut r = TokenRecord::from_query(&TokenQuery::new(chain_id, Address::repeat_byte(byte)));
        r.symbol = "TKN".to_string();
        r.decimals = 18;
        r.balance = Balance::new(U256::from(raw), 18);
        r
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_hit_then_stale() {
        let cache = FreshnessCache::new(Duration::from_secs(60), 100);
        let owner = Some(Address::repeat_byte(0xab));
        cache.insert(record(1, 1, 5), owner);

        assert!(matches!(
            cache.lookup(1, Address::repeat_byte(1), owner),
            CacheLookup::Fresh(_)
        ));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.lookup(1, Address::repeat_byte(1), owner), CacheLookup::Stale);
    }

    #[test]
    fn test_owner_isolation() {
        let cache = FreshnessCache::default();
        cache.insert(record(1, 1, 5), Some(Address::repeat_byte(0xaa)));
        assert_eq!(
            cache.lookup(1, Address::repeat_byte(1), Some(Address::repeat_byte(0xbb))),
            CacheLookup::OwnerMismatch
        );
        assert_eq!(cache.lookup(10, Address::repeat_byte(1), None), CacheLookup::Miss);
    }

    #[test]
    fn test_older_write_loses() {
        let cache = FreshnessCache::default();
        let owner = Some(Address::repeat_byte(0xaa));
        let now = Instant::now();
        cache.insert_at(record(1, 1, 10), owner, now);
        cache.insert_at(record(1, 1, 99), owner, now - Duration::from_secs(5));

        let entry = cache.get(1, Address::repeat_byte(1)).unwrap();
        assert_eq!(entry.record.balance.raw, U256::from(10u64));
    }

    #[test]
    fn test_insert_merges_metadata() {
        let cache = FreshnessCache::default();
        cache.insert(record(1, 1, 10), None);
        let mut update = record(1, 1, 20);
        update.symbol = String::new();
        let stored = cache.insert(update, None);
        assert_eq!(stored.symbol, "TKN");
        assert_eq!(stored.balance.raw, U256::from(20u64));
    }

    #[test]
    fn test_stored_balance_matches_stored_decimals() {
        let cache = FreshnessCache::default();
        cache.insert(record(1, 1, 10), None);
        let mut update = record(1, 1, 2_500_000);
        update.decimals = 6;
        update.balance = Balance::new(U256::from(2_500_000u64), 6);

        let stored = cache.insert(update, None);
        assert_eq!(stored.decimals, 18);
        assert_eq!(stored.balance, Balance::new(U256::from(2_500_000u64), 18));
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let cache = FreshnessCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        cache.insert_at(record(1, 1, 1), None, now - Duration::from_secs(3));
        cache.insert_at(record(1, 2, 1), None, now - Duration::from_secs(2));
        cache.insert_at(record(1, 3, 1), None, now);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(1, Address::repeat_byte(1)).is_none());
        assert!(cache.get(1, Address::repeat_byte(3)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_uses_chain_gc_time() {
        let cache = FreshnessCache::default();
        cache.insert(record(1, 1, 1), None);
        cache.insert(record(137, 1, 1), None);
        tokio::time::advance(Duration::from_secs(120)).await;

        let removed = cache.purge_expired(|chain| {
            if chain == 137 {
                Duration::from_secs(60)
            } else {
                Duration::from_secs(600)
            }
        });
        assert_eq!(removed, 1);
        assert!(cache.get(1, Address::repeat_byte(1)).is_some());
    }

    #[test]
    fn test_key_format() {
        assert_eq!(
            FreshnessCache::key(10, Address::repeat_byte(0xab)),
            "10/0xabababababababababababababababababababab"
        );
    }
}
