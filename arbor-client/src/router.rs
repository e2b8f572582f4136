//! # Invalidation Routing
//!
//! Server pushes name a `(db, table, key)` by string. The router owns the
//! mapping from table name to that table's cache and applies each push to it.

use std::sync::Arc;

use arbor_common::PushEvent;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::cache::ClientCache;

/// Receiver of server push events, installed on every pooled connection.
pub trait InvalidationHandler: Send + Sync + 'static {
    fn on_invalidate(&self, event: &PushEvent);
}

impl<F> InvalidationHandler for F
where
    F: Fn(&PushEvent) + Send + Sync + 'static,
{
    fn on_invalidate(&self, event: &PushEvent) {
        self(event)
    }
}

/// Type-erased view of a table cache.
pub trait Invalidate: Send + Sync {
    fn invalidate_key(&self, key: &str);
    fn invalidate_table(&self);
}

impl<V: Clone + Send + Sync> Invalidate for ClientCache<V> {
    fn invalidate_key(&self, key: &str) {
        self.invalidate(key);
    }

    fn invalidate_table(&self) {
        self.invalidate_all();
    }
}

/// Routes pushes for one database to the registered table caches.
pub struct InvalidationRouter {
    db: String,
    tables: DashMap<String, Arc<dyn Invalidate>>,
}

impl InvalidationRouter {
    pub fn new(db: impl Into<String>) -> Self {
        InvalidationRouter {
            db: db.into(),
            tables: DashMap::new(),
        }
    }

    /// Registers (or replaces) the cache of `table`.
    pub fn register(&self, table: impl Into<String>, cache: Arc<dyn Invalidate>) {
        self.tables.insert(table.into(), cache);
    }

    pub fn unregister(&self, table: &str) {
        self.tables.remove(table);
    }

    pub fn is_registered(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Applies one push; returns whether a cache was touched.
    pub fn route(&self, event: &PushEvent) -> bool {
        if event.db != self.db {
            trace!(db = %event.db, "push for another database");
            return false;
        }
        // Clone out of the map so the shard lock is not held during invalidation.
        let Some(cache) = self.tables.get(&event.table).map(|entry| Arc::clone(entry.value()))
        else {
            trace!(table = %event.table, "push for uncached table");
            return false;
        };

        if event.is_table_wide() {
            debug!(table = %event.table, "invalidating table");
            cache.invalidate_table();
        } else {
            trace!(table = %event.table, key = %event.key, "invalidating key");
            cache.invalidate_key(&event.key);
        }
        true
    }
}

impl InvalidationHandler for InvalidationRouter {
    fn on_invalidate(&self, event: &PushEvent) {
        self.route(event);
    }
}

impl std::fmt::Debug for InvalidationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationRouter")
            .field("db", &self.db)
            .field("tables", &self.tables.len())
            .finish()
    }
}
