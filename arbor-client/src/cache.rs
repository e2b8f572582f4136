//! # Client-Side Table Cache
//!
//! Bounded, TTL-aware read cache for one table, kept coherent by local
//! invalidation on writes and by server pushes.
//!
//! ## Usage
//!
//! - `ClientCache::new(&CacheConfig)` sizes shards from CPU parallelism.
//! - `ClientCache::with_shards` pins the shard count (one shard gives exact LRU).
//! - Missing results are never inserted: callers only `insert` real values.
//! - Fetch-then-fill callers read `epoch(key)` before the request and fill
//!   through `insert_if_unchanged`, so a response racing an invalidation is
//!   dropped instead of cached.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard locks keep concurrent readers apart.
//! 2. **Approximate LRU**: Each shard runs its own LRU over an equal share of
//!    the entry budget, so eviction order is exact within a shard only.
//! 3. **TTL on Access**: Expired entries are dropped when touched; a sweep via
//!    `purge_expired` reclaims the rest.
//!
//! ## Structure Overview
//!
//! ```text
//! ClientCache<V>
//!   └── shards: Vec<Shard<V>>
//!         └── RwLock<ShardInner<V>>
//!               ├── map: HashMap<Arc<str>, usize>
//!               ├── nodes: Vec<Option<Node<V>>>
//!               ├── free: Vec<usize>
//!               ├── epoch: u64 (bumped by every invalidation)
//!               └── head/tail: LRU indices
//!                     └── Node { key, value, expires_at, prev, next }
//! ```

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::CacheConfig;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// Shards are not split below this many entries each.
const MIN_SHARD_CAPACITY: usize = 16;

#[derive(Debug)]
struct Node<V> {
    // Same Arc as the map key.
    key: Arc<str>,
    value: V,
    expires_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct ShardInner<V> {
    map: HashMap<Arc<str>, usize, RandomState>,
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    /// LRU head (oldest) and tail (most recent).
    head: Option<usize>,
    tail: Option<usize>,
    /// Invalidation counter; eviction and expiry leave it alone.
    epoch: u64,
}

impl<V> ShardInner<V> {
    fn new(hash_state: RandomState) -> Self {
        ShardInner {
            map: HashMap::with_hasher(hash_state),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            epoch: 0,
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    /// Detaches `idx` from the LRU list.
    fn lru_remove(&mut self, idx: usize) {
        let (prev, next) = match self.nodes[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev.and_then(|p| self.nodes[p].as_mut()) {
            Some(prev_node) => prev_node.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.nodes[n].as_mut()) {
            Some(next_node) => next_node.prev = prev,
            None => self.tail = prev,
        }

        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    /// Appends `idx` at the most-recently-used end.
    fn lru_push_back(&mut self, idx: usize) {
        let tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = tail;
            node.next = None;
        }
        match tail.and_then(|t| self.nodes[t].as_mut()) {
            Some(tail_node) => tail_node.next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return;
        }
        self.lru_remove(idx);
        self.lru_push_back(idx);
    }

    fn insert_new(&mut self, key: Arc<str>, value: V, expires_at: Instant) {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.nodes.push(None);
                self.nodes.len() - 1
            }
        };
        self.nodes[idx] = Some(Node {
            key: Arc::clone(&key),
            value,
            expires_at,
            prev: None,
            next: None,
        });
        self.lru_push_back(idx);
        self.map.insert(key, idx);
    }

    fn remove_idx(&mut self, idx: usize) -> bool {
        let key = match self.nodes[idx].as_ref() {
            Some(node) => Arc::clone(&node.key),
            None => return false,
        };
        // Detach before clearing the slot so neighbour links stay valid.
        self.lru_remove(idx);
        self.nodes[idx] = None;
        self.map.remove(key.as_ref());
        self.free.push(idx);
        true
    }

    fn pop_lru(&mut self) -> bool {
        match self.head {
            Some(idx) => self.remove_idx(idx),
            None => false,
        }
    }

    fn clear(&mut self) -> usize {
        let removed = self.map.len();
        self.map.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        removed
    }
}

#[derive(Debug)]
struct Shard<V> {
    inner: RwLock<ShardInner<V>>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Bounded TTL cache for one table's values.
#[derive(Debug)]
pub struct ClientCache<V> {
    shards: Vec<Shard<V>>,
    /// Power-of-two shard count minus one.
    shard_mask: usize,
    hash_state: RandomState,
    per_shard_capacity: usize,
    ttl: Duration,
    stats: Option<StatCounters>,
}

impl<V: Clone> ClientCache<V> {
    /// Creates a cache sized from the configuration and CPU parallelism.
    pub fn new(config: &CacheConfig) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        let by_cpu = threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER);
        let by_size = (config.max_size / MIN_SHARD_CAPACITY).max(1);
        Self::with_shards(by_cpu.min(by_size), config.max_size, config.ttl, config.stats)
    }

    /// Creates a cache with an explicit shard count.
    ///
    /// The count is rounded up to a power of two; `max_size` is split evenly
    /// across shards.
    pub fn with_shards(shards: usize, max_size: usize, ttl: Duration, stats: bool) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                inner: RwLock::new(ShardInner::new(hash_state.clone())),
            })
            .collect();

        ClientCache {
            shards,
            shard_mask: shard_count - 1,
            hash_state,
            per_shard_capacity: max_size.max(1).div_ceil(shard_count),
            ttl,
            stats: stats.then(StatCounters::default),
        }
    }

    /// Default entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a live entry and marks it recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.shard_for(key).inner.write();

        let idx = match inner.map.get(key) {
            Some(&idx) => idx,
            None => {
                self.count(|s| &s.misses);
                return None;
            }
        };

        let expired = inner.nodes[idx]
            .as_ref()
            .map(|node| node.expires_at <= now)
            .unwrap_or(true);
        if expired {
            inner.remove_idx(idx);
            self.count(|s| &s.misses);
            return None;
        }

        let value = inner.nodes[idx].as_ref().map(|node| node.value.clone());
        inner.touch(idx);
        self.count(|s| &s.hits);
        value
    }

    /// Inserts or replaces an entry with the default TTL.
    pub fn insert(&self, key: &str, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    /// Inserts or replaces an entry; the lifetime never exceeds the default TTL.
    pub fn insert_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let mut inner = self.shard_for(key).inner.write();
        self.store(&mut inner, key, value, ttl);
    }

    /// Invalidation epoch of the shard holding `key`.
    ///
    /// Read it before fetching a value that will be filled with
    /// [`insert_if_unchanged`](Self::insert_if_unchanged).
    pub fn epoch(&self, key: &str) -> u64 {
        self.shard_for(key).inner.read().epoch
    }

    /// Inserts with the default TTL unless an invalidation reached the key's
    /// shard after `epoch` was read. Returns whether the value was stored.
    pub fn insert_if_unchanged(&self, key: &str, value: V, epoch: u64) -> bool {
        let mut inner = self.shard_for(key).inner.write();
        if inner.epoch != epoch {
            return false;
        }
        self.store(&mut inner, key, value, self.ttl);
        true
    }

    /// Drops one entry; returns whether it was present.
    ///
    /// The shard epoch moves even when the key is absent, which voids fills
    /// for fetches already in flight.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.shard_for(key).inner.write();
        inner.epoch = inner.epoch.wrapping_add(1);
        let removed = match inner.map.get(key) {
            Some(&idx) => inner.remove_idx(idx),
            None => false,
        };
        if removed {
            self.count(|s| &s.invalidations);
        }
        removed
    }

    /// Drops every entry.
    pub fn invalidate_all(&self) {
        for shard in &self.shards {
            let mut inner = shard.inner.write();
            inner.epoch = inner.epoch.wrapping_add(1);
            let removed = inner.clear();
            drop(inner);
            if let Some(stats) = &self.stats {
                stats
                    .invalidations
                    .fetch_add(removed as u64, Ordering::Relaxed);
            }
        }
    }

    /// Removes expired entries across all shards (O(n) sweep).
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut inner = shard.inner.write();
            let expired: Vec<usize> = inner
                .map
                .values()
                .copied()
                .filter(|&idx| {
                    inner.nodes[idx]
                        .as_ref()
                        .is_some_and(|node| node.expires_at <= now)
                })
                .collect();
            for idx in expired {
                if inner.remove_idx(idx) {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Number of stored entries, expired ones included until touched or purged.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.inner.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters, when stats were enabled at construction.
    pub fn stats(&self) -> Option<CacheStats> {
        self.stats.as_ref().map(|s| CacheStats {
            hits: s.hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            evictions: s.evictions.load(Ordering::Relaxed),
            invalidations: s.invalidations.load(Ordering::Relaxed),
        })
    }

    fn store(&self, inner: &mut ShardInner<V>, key: &str, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl.min(self.ttl);

        if let Some(&idx) = inner.map.get(key) {
            if let Some(node) = inner.nodes[idx].as_mut() {
                node.value = value;
                node.expires_at = expires_at;
            }
            inner.touch(idx);
            return;
        }

        while inner.len() >= self.per_shard_capacity {
            if !inner.pop_lru() {
                break;
            }
            self.count(|s| &s.evictions);
        }
        inner.insert_new(Arc::from(key), value, expires_at);
    }

    fn shard_for(&self, key: &str) -> &Shard<V> {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key.as_bytes());
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }

    fn count(&self, pick: impl Fn(&StatCounters) -> &AtomicU64) {
        if let Some(stats) = &self.stats {
            pick(stats).fetch_add(1, Ordering::Relaxed);
        }
    }
}
