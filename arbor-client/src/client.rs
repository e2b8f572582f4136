//! # Client Handle
//!
//! Purpose: The one object an application builds to talk to the store. It
//! owns the connection pool, schema ids, table caches and metrics.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling, registration and push
//!    routing behind `table()`.
//! 2. **Explicit Construction**: Callers build and pass the handle; there is
//!    no process-wide instance.
//! 3. **Shared Caches**: Opening the same table twice yields the same cache,
//!    so pushes reach every handle.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arbor_common::{TableRef, WireFormat};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::cache::ClientCache;
use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::payload::Payload;
use crate::pool::ConnectionPool;
use crate::router::InvalidationRouter;
use crate::schema::{SchemaRegistry, TableSchema};
use crate::table::Table;

type AnyCache = Arc<dyn Any + Send + Sync>;

/// Connected client for one database.
pub struct Client {
    config: Arc<ClientConfig>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<ClientMetrics>,
    registry: SchemaRegistry,
    router: Arc<InvalidationRouter>,
    router_installed: AtomicBool,
    caches: DashMap<String, AnyCache>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.config.addr)
            .field("db", &self.config.db)
            .field("pool", &self.pool)
            .finish()
    }
}

impl Client {
    /// Validates the configuration and opens the pool.
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let metrics = Arc::new(ClientMetrics::new());
        let pool = ConnectionPool::connect(Arc::clone(&config), Arc::clone(&metrics)).await?;

        Ok(Client {
            registry: SchemaRegistry::new(config.db.as_str()),
            router: Arc::new(InvalidationRouter::new(config.db.as_str())),
            pool: Arc::new(pool),
            metrics,
            router_installed: AtomicBool::new(false),
            caches: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn router(&self) -> &Arc<InvalidationRouter> {
        &self.router
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Opens a table with no declared query columns.
    pub async fn table<V: Payload + Clone>(&self, name: &str) -> ClientResult<Table<V>> {
        self.table_with_schema(TableSchema::new(name)).await
    }

    /// Opens a table, registering its schema on first use.
    pub async fn table_with_schema<V: Payload + Clone>(
        &self,
        schema: TableSchema,
    ) -> ClientResult<Table<V>> {
        let target = match self.config.wire_format {
            WireFormat::Compact => self.registry.resolve(&self.pool, &schema).await?,
            WireFormat::Legacy => TableRef::names(self.config.db.as_str(), schema.table.as_str()),
        };

        let cache = if self.config.cache.enabled {
            Some(self.enable_cache::<V>(&schema.table, &target).await)
        } else {
            None
        };

        Ok(Table::new(
            schema.table.as_str(),
            target,
            Arc::clone(&self.pool),
            cache,
            self.config.safe_writes,
        ))
    }

    /// Returns the table's cache, creating and subscribing it on first use.
    async fn enable_cache<V: Payload + Clone>(
        &self,
        table: &str,
        target: &TableRef,
    ) -> Arc<ClientCache<V>> {
        if let Some(existing) = self.caches.get(table).map(|entry| Arc::clone(entry.value())) {
            match existing.downcast::<ClientCache<V>>() {
                Ok(cache) => return cache,
                Err(_) => warn!(table, "table reopened with another value type, cache replaced"),
            }
        }

        if !self.router_installed.swap(true, Ordering::AcqRel) {
            self.pool.set_invalidation_handler(self.router.clone());
            info!(db = %self.config.db, "client cache enabled");
        }

        let cache = Arc::new(ClientCache::<V>::new(&self.config.cache));
        self.caches.insert(table.to_string(), cache.clone());
        self.router.register(table, cache.clone());

        match self.pool.subscribe(target.clone()).await {
            Ok(()) => info!(table, "subscribed to invalidations"),
            Err(err) => warn!(table, error = %err, "invalidation subscribe failed"),
        }
        cache
    }

    /// Stops every connection; requests still pending fail with `Shutdown`.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }
}
