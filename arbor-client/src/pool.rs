//! # Connection Pool
//!
//! Purpose: Spread requests over a fixed set of pipelined connections.
//!
//! ## Design Principles
//! 1. **Fixed Membership**: Connections are opened once and heal themselves;
//!    the pool never grows or shrinks. A member that cannot connect at
//!    startup joins later from the background.
//! 2. **O(1) Common Case**: An atomic round-robin cursor picks the candidate.
//! 3. **Bounded Tail Latency**: A candidate past half its pipeline limit is
//!    swapped for the least-loaded connection.
//!
//! ## Notes
//! - Two requests for the same key may travel on different connections, so
//!   their relative order is not preserved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arbor_common::{Flags, Op, TableRef};
use bytes::Bytes;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnState, Connection, PendingResult};
use crate::error::{ClientError, ClientResult};
use crate::metrics::ClientMetrics;
use crate::router::InvalidationHandler;

/// Load summary of one pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub index: usize,
    pub state: ConnState,
    pub pending: usize,
}

/// Fixed-size set of connections with load-aware selection.
#[derive(Debug)]
pub struct ConnectionPool {
    connections: Vec<Connection>,
    cursor: AtomicUsize,
    pipeline_limit: usize,
}

impl ConnectionPool {
    /// Opens `config.pool_size` connections.
    ///
    /// Fails only when no member can connect, or on a non-retryable error.
    /// Members whose first attempt fails keep retrying in the background.
    pub async fn connect(config: Arc<ClientConfig>, metrics: Arc<ClientMetrics>) -> ClientResult<Self> {
        config.validate()?;
        let mut connections = Vec::with_capacity(config.pool_size);
        let mut first_err = None;
        for index in 0..config.pool_size {
            match Connection::connect(index, Arc::clone(&config), Arc::clone(&metrics)).await {
                Ok(conn) => connections.push(conn),
                Err(err) if err.is_retryable() => {
                    warn!(conn = index, error = %err, "connection unavailable, retrying in background");
                    let conn = Connection::start(index, Arc::clone(&config), Arc::clone(&metrics));
                    connections.push(conn);
                    first_err.get_or_insert(err);
                }
                Err(err) => {
                    Self::stop_all(&connections).await;
                    return Err(err);
                }
            }
        }

        let ready = connections
            .iter()
            .filter(|conn| conn.state() == ConnState::Ready)
            .count();
        if ready == 0 {
            if let Some(err) = first_err {
                Self::stop_all(&connections).await;
                return Err(err);
            }
        }
        info!(addr = %config.addr, size = connections.len(), ready, "connection pool ready");
        Self::from_connections(connections, config.pipeline_limit)
    }

    /// Builds a pool over already-open connections.
    pub fn from_connections(connections: Vec<Connection>, pipeline_limit: usize) -> ClientResult<Self> {
        if connections.is_empty() {
            return Err(ClientError::Config("pool needs at least one connection".into()));
        }
        Ok(ConnectionPool {
            connections,
            cursor: AtomicUsize::new(0),
            pipeline_limit,
        })
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Picks the connection for the next request.
    ///
    /// Members that are not `Ready` are passed over while any other is.
    pub fn acquire(&self) -> &Connection {
        let next = self.cursor.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        let candidate = &self.connections[next];
        if candidate.state() == ConnState::Ready
            && candidate.pending_count() <= self.pipeline_limit / 2
        {
            return candidate;
        }
        self.connections
            .iter()
            .filter(|conn| conn.state() == ConnState::Ready)
            .min_by_key(|conn| conn.pending_count())
            .unwrap_or(candidate)
    }

    /// Sends on the connection chosen by `acquire`.
    pub async fn send(
        &self,
        op: Op,
        target: TableRef,
        key: impl Into<String>,
        payload: Bytes,
        flags: Flags,
    ) -> ClientResult<PendingResult> {
        self.acquire().send(op, target, key, payload, flags).await
    }

    /// Sends and waits for the outcome.
    pub async fn request(
        &self,
        op: Op,
        target: TableRef,
        key: impl Into<String>,
        payload: Bytes,
        flags: Flags,
    ) -> ClientResult<Bytes> {
        self.send(op, target, key, payload, flags).await?.await
    }

    /// Installs one push handler on every connection.
    pub fn set_invalidation_handler(&self, handler: Arc<dyn InvalidationHandler>) {
        for conn in &self.connections {
            conn.set_invalidation_handler(Arc::clone(&handler));
        }
    }

    /// Subscribes every connection to pushes for `target`.
    ///
    /// All connections are tried; the first failure is returned.
    pub async fn subscribe(&self, target: TableRef) -> ClientResult<()> {
        let mut first_err = None;
        for conn in &self.connections {
            if let Err(err) = conn.subscribe(target.clone()).await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Requests in flight across the pool.
    pub fn total_pending(&self) -> usize {
        self.connections.iter().map(Connection::pending_count).sum()
    }

    pub fn stats(&self) -> Vec<ConnectionStats> {
        self.connections
            .iter()
            .map(|conn| ConnectionStats {
                index: conn.index(),
                state: conn.state(),
                pending: conn.pending_count(),
            })
            .collect()
    }

    /// Stops every connection; pending requests fail with `Shutdown`.
    pub async fn stop(&self) {
        Self::stop_all(&self.connections).await;
    }

    async fn stop_all(connections: &[Connection]) {
        for conn in connections {
            conn.stop().await;
        }
    }
}
