//! # Arbor Client
//!
//! Purpose: Client-side transport for the Arbor key/value and query store:
//! pipelined TCP sessions, load-balanced pooling and a push-invalidated
//! read cache.
//!
//! ## Design Principles
//! 1. **Pipelining**: Many requests share one socket, correlated by id.
//! 2. **Self-Healing Sessions**: Connections reconnect on their own; callers
//!    see failed requests, never a dead client.
//! 3. **Typed Errors**: Transport, protocol, application, back-pressure and
//!    auth failures are distinct variants.
//! 4. **Coherent Caching**: Local writes and server pushes keep table caches
//!    honest.
//!
//! ## Layers
//!
//! ```text
//! Client ── Table<V> / BatchedTable<V>
//!   │            │
//!   │            └── ClientCache<V> <── InvalidationRouter <── pushes
//!   └── ConnectionPool ── Connection × N ── TCP
//! ```

pub mod auth;
pub mod cache;
mod client;
pub mod config;
pub mod connection;
mod error;
pub mod metrics;
mod payload;
pub mod pool;
pub mod router;
mod schema;
mod table;

pub use cache::{CacheStats, ClientCache};
pub use client::Client;
pub use config::{CacheConfig, ClientConfig};
pub use connection::{ConnState, Connection, PendingResult};
pub use error::{ClientError, ClientResult};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use payload::{Json, Payload};
pub use pool::{ConnectionPool, ConnectionStats};
pub use router::{Invalidate, InvalidationHandler, InvalidationRouter};
pub use schema::{ColumnDef, SchemaRegistry, TableSchema};
pub use table::{BatchedTable, QueryKind, Table, MAX_BATCH_SIZE};

pub use arbor_common::{Flags, Op, PushEvent, TableRef, WireFormat};
