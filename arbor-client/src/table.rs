//! # Typed Tables
//!
//! Purpose: Key/value operations on one table, with the client cache in front
//! of the network when enabled.
//!
//! ## Cache Rules
//! 1. **Read Through**: `get` consults the cache, fetches on a miss and fills
//!    the cache only with values that exist.
//! 2. **Optimistic Writes**: `set` caches the new value before the request
//!    completes and drops it again if the write fails.
//! 3. **Delete First**: `delete` invalidates locally before sending.
//! 4. **Batched Misses**: `get_many` sends one MGET for all cache misses.
//! 5. **Bulk Mutations**: A successful query update or delete clears the whole
//!    table cache, since the affected keys are unknown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arbor_common::wire;
use arbor_common::{Flags, Op, TableRef};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::debug;

use crate::cache::{CacheStats, ClientCache};
use crate::error::{ClientError, ClientResult};
use crate::payload::Payload;
use crate::pool::ConnectionPool;

/// Keys queued past this count flush a batch immediately.
pub const MAX_BATCH_SIZE: usize = 500;

/// Server-side query operations; the filter payload is opaque here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Get,
    Update,
    Delete,
    Count,
}

impl QueryKind {
    fn op(self) -> Op {
        match self {
            QueryKind::Get => Op::QueryGet,
            QueryKind::Update => Op::QueryUpdate,
            QueryKind::Delete => Op::QueryDelete,
            QueryKind::Count => Op::QueryCount,
        }
    }

    fn mutates(self) -> bool {
        matches!(self, QueryKind::Update | QueryKind::Delete)
    }
}

/// Handle to one table holding values of type `V`.
pub struct Table<V> {
    name: Arc<str>,
    target: TableRef,
    pool: Arc<ConnectionPool>,
    cache: Option<Arc<ClientCache<V>>>,
    safe: bool,
}

impl<V> Clone for Table<V> {
    fn clone(&self) -> Self {
        Table {
            name: Arc::clone(&self.name),
            target: self.target.clone(),
            pool: Arc::clone(&self.pool),
            cache: self.cache.clone(),
            safe: self.safe,
        }
    }
}

impl<V> std::fmt::Debug for Table<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("cached", &self.cache.is_some())
            .field("safe", &self.safe)
            .finish()
    }
}

impl<V: Payload + Clone> Table<V> {
    /// Builds a table handle over resolved addressing.
    pub fn new(
        name: impl Into<Arc<str>>,
        target: TableRef,
        pool: Arc<ConnectionPool>,
        cache: Option<Arc<ClientCache<V>>>,
        safe: bool,
    ) -> Self {
        Table {
            name: name.into(),
            target,
            pool,
            cache,
            safe,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &TableRef {
        &self.target
    }

    /// Same table with durable writes switched on or off.
    pub fn with_safe_writes(mut self, safe: bool) -> Self {
        self.safe = safe;
        self
    }

    fn write_flags(&self) -> Flags {
        if self.safe {
            Flags::SAFE
        } else {
            Flags::NONE
        }
    }

    /// Reads one value; `None` when the key does not exist.
    pub async fn get(&self, key: &str) -> ClientResult<Option<V>> {
        let epoch = match &self.cache {
            Some(cache) => match cache.get(key) {
                Some(value) => return Ok(Some(value)),
                None => Some(cache.epoch(key)),
            },
            None => None,
        };

        let body = self
            .pool
            .request(Op::Get, self.target.clone(), key, Bytes::new(), Flags::SAFE)
            .await?;
        if body.is_empty() {
            return Ok(None);
        }

        let value = V::from_payload(body)?;
        if let (Some(cache), Some(epoch)) = (&self.cache, epoch) {
            cache.insert_if_unchanged(key, value.clone(), epoch);
        }
        Ok(Some(value))
    }

    /// Reads many values with at most one round trip; missing keys are absent
    /// from the result.
    pub async fn get_many<S: AsRef<str>>(&self, keys: &[S]) -> ClientResult<HashMap<String, V>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut misses: Vec<&str> = Vec::new();
        // Epoch per missed key, read before the request goes out.
        let mut epochs: HashMap<&str, u64> = HashMap::new();
        for key in keys {
            let key = key.as_ref();
            match &self.cache {
                Some(cache) => match cache.get(key) {
                    Some(value) => {
                        found.insert(key.to_string(), value);
                    }
                    None => {
                        epochs.insert(key, cache.epoch(key));
                        misses.push(key);
                    }
                },
                None => misses.push(key),
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }

        let payload = wire::encode_mget_keys(&misses).map_err(ClientError::InvalidRequest)?;
        let body = self
            .pool
            .request(Op::Mget, self.target.clone(), "", payload, Flags::SAFE)
            .await?;
        for (key, raw) in wire::decode_mget_values(body)? {
            let value = V::from_payload(raw)?;
            if let (Some(cache), Some(&epoch)) = (&self.cache, epochs.get(key.as_str())) {
                cache.insert_if_unchanged(&key, value.clone(), epoch);
            }
            found.insert(key, value);
        }
        Ok(found)
    }

    /// Writes one value.
    pub async fn set(&self, key: &str, value: V) -> ClientResult<()> {
        let payload = value.to_payload()?;
        self.cache_optimistic(key, value, payload.is_empty(), None);
        self.write(Op::Set, key, payload, self.write_flags()).await
    }

    /// Writes one value that the server expires after `ttl`.
    pub async fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> ClientResult<()> {
        let now = SystemTime::now();
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or(now)
            .duration_since(UNIX_EPOCH)
            .map_err(|err| ClientError::Payload(format!("clock before epoch: {err}")))?;
        let expires_at_ms = u64::try_from(expires_at.as_millis()).unwrap_or(u64::MAX);
        let encoded = value.to_payload()?;
        let payload = wire::encode_ttl_payload(expires_at_ms, &encoded);

        self.cache_optimistic(key, value, encoded.is_empty(), Some(ttl));
        self.write(Op::Set, key, payload, self.write_flags() | Flags::TTL_PREFIXED)
            .await
    }

    /// Caches a value ahead of its write. An empty payload reads back as
    /// missing, so it only clears whatever the key held before.
    fn cache_optimistic(&self, key: &str, value: V, empty: bool, ttl: Option<Duration>) {
        let Some(cache) = &self.cache else {
            return;
        };
        match (empty, ttl) {
            (true, _) => {
                cache.invalidate(key);
            }
            (false, Some(ttl)) => cache.insert_with_ttl(key, value, ttl),
            (false, None) => cache.insert(key, value),
        }
    }

    async fn write(&self, op: Op, key: &str, payload: Bytes, flags: Flags) -> ClientResult<()> {
        let result = self
            .pool
            .request(op, self.target.clone(), key, payload, flags)
            .await;
        if let Err(err) = &result {
            // Never leave an optimistic value behind for a write that failed.
            if let Some(cache) = &self.cache {
                cache.invalidate(key);
            }
            debug!(table = %self.name, key, error = %err, "write failed");
        }
        result.map(|_| ())
    }

    /// Deletes one key.
    pub async fn delete(&self, key: &str) -> ClientResult<()> {
        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }
        self.pool
            .request(Op::Delete, self.target.clone(), key, Bytes::new(), self.write_flags())
            .await
            .map(|_| ())
    }

    /// Whether the key exists on the server.
    pub async fn exists(&self, key: &str) -> ClientResult<bool> {
        if self
            .cache
            .as_ref()
            .is_some_and(|cache| cache.get(key).is_some())
        {
            return Ok(true);
        }
        let body = self
            .pool
            .request(Op::Exists, self.target.clone(), key, Bytes::new(), Flags::SAFE)
            .await?;
        Ok(body.first() == Some(&1))
    }

    /// Runs a server-side query with an encoded filter and returns the raw body.
    pub async fn query(&self, kind: QueryKind, filter: Bytes) -> ClientResult<Bytes> {
        let body = self
            .pool
            .request(kind.op(), self.target.clone(), "", filter, Flags::SAFE)
            .await?;
        if kind.mutates() {
            self.invalidate_all();
        }
        Ok(body)
    }

    /// Counts matching rows; the server answers with a decimal number.
    pub async fn count(&self, filter: Bytes) -> ClientResult<u64> {
        let body = self.query(QueryKind::Count, filter).await?;
        std::str::from_utf8(&body)
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .ok_or_else(|| ClientError::Payload("count reply is not a number".into()))
    }

    /// Drops one cached entry.
    pub fn invalidate(&self, key: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }
    }

    /// Drops every cached entry of this table.
    pub fn invalidate_all(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }

    pub fn cache(&self) -> Option<&Arc<ClientCache<V>>> {
        self.cache.as_ref()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().and_then(|cache| cache.stats())
    }

    /// Wraps the table so single-key reads within `delay` share one MGET.
    pub fn with_batch(&self, delay: Duration) -> BatchedTable<V> {
        BatchedTable::new(self.clone(), delay)
    }
}

type Waiter<V> = oneshot::Sender<ClientResult<Option<V>>>;

struct Batch<V> {
    keys: Vec<String>,
    waiters: Vec<Waiter<V>>,
    /// Bumped whenever the batch is taken, so a stale timer finds nothing.
    generation: u64,
    timer_armed: bool,
}

struct Batcher<V> {
    table: Table<V>,
    delay: Duration,
    batch: Mutex<Batch<V>>,
}

/// Table wrapper that coalesces concurrent `get` calls into MGET requests.
pub struct BatchedTable<V> {
    inner: Arc<Batcher<V>>,
}

impl<V> Clone for BatchedTable<V> {
    fn clone(&self) -> Self {
        BatchedTable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Payload + Clone> BatchedTable<V> {
    pub fn new(table: Table<V>, delay: Duration) -> Self {
        BatchedTable {
            inner: Arc::new(Batcher {
                table,
                delay,
                batch: Mutex::new(Batch {
                    keys: Vec::new(),
                    waiters: Vec::new(),
                    generation: 0,
                    timer_armed: false,
                }),
            }),
        }
    }

    /// The wrapped table, for writes and uncoalesced reads.
    pub fn table(&self) -> &Table<V> {
        &self.inner.table
    }

    /// Reads one value through the current batch.
    pub async fn get(&self, key: &str) -> ClientResult<Option<V>> {
        let (tx, rx) = oneshot::channel();
        let mut arm_timer = None;
        let full = {
            let mut batch = self.inner.batch.lock();
            batch.keys.push(key.to_string());
            batch.waiters.push(tx);
            if batch.keys.len() >= MAX_BATCH_SIZE {
                true
            } else {
                if !batch.timer_armed {
                    batch.timer_armed = true;
                    arm_timer = Some(batch.generation);
                }
                false
            }
        };

        if full {
            if let Some((keys, waiters)) = self.inner.take(None) {
                tokio::spawn(Arc::clone(&self.inner).resolve(keys, waiters));
            }
        } else if let Some(generation) = arm_timer {
            let batcher = Arc::clone(&self.inner);
            tokio::spawn(async move {
                sleep(batcher.delay).await;
                if let Some((keys, waiters)) = batcher.take(Some(generation)) {
                    batcher.resolve(keys, waiters).await;
                }
            });
        }

        rx.await.unwrap_or(Err(ClientError::Shutdown))
    }

    pub async fn set(&self, key: &str, value: V) -> ClientResult<()> {
        self.inner.table.set(key, value).await
    }

    pub async fn delete(&self, key: &str) -> ClientResult<()> {
        self.inner.table.delete(key).await
    }
}

impl<V: Payload + Clone> Batcher<V> {
    /// Takes the queued batch; with `generation`, only if it is still that batch.
    fn take(&self, generation: Option<u64>) -> Option<(Vec<String>, Vec<Waiter<V>>)> {
        let mut batch = self.batch.lock();
        if generation.is_some_and(|g| g != batch.generation) || batch.keys.is_empty() {
            return None;
        }
        batch.generation += 1;
        batch.timer_armed = false;
        Some((
            std::mem::take(&mut batch.keys),
            std::mem::take(&mut batch.waiters),
        ))
    }

    async fn resolve(self: Arc<Self>, keys: Vec<String>, waiters: Vec<Waiter<V>>) {
        if let [key] = keys.as_slice() {
            let result = self.table.get(key).await;
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
            return;
        }

        match self.table.get_many(&keys).await {
            Ok(found) => {
                // Duplicate keys in one batch each get the value.
                for (key, waiter) in keys.iter().zip(waiters) {
                    let _ = waiter.send(Ok(found.get(key).cloned()));
                }
            }
            Err(err) => {
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }
}
