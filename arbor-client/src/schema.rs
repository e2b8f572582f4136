//! # Schema Registration
//!
//! Tables are described by explicit `TableSchema` values instead of being
//! scanned from types at runtime. Registering a schema trades the db and table
//! names for the compact numeric ids used on every later request.
//!
//! ## Notes
//! - The request carries the db name as its key, ids `0/0`, and the schema as
//!   JSON: `{"table": .., "columns": [..]}`.
//! - The reply is `dbId(1) | tableId(2)`.
//! - Ids are cached per table name, so each table registers once per client.

use arbor_common::wire;
use arbor_common::{Flags, Op, TableRef};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientResult;
use crate::pool::ConnectionPool;

/// One queryable column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// SQL type, e.g. `VARCHAR(255)` or `BIGINT`.
    #[serde(rename = "type")]
    pub sql_type: String,
    pub indexed: bool,
    pub unique: bool,
    pub length: u32,
}

impl ColumnDef {
    /// Unindexed column of the given SQL type.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        ColumnDef {
            name: name.into(),
            sql_type: sql_type.into(),
            indexed: false,
            unique: false,
            length: 255,
        }
    }

    /// `VARCHAR(length)` column.
    pub fn varchar(name: impl Into<String>, length: u32) -> Self {
        ColumnDef {
            length,
            ..ColumnDef::new(name, format!("VARCHAR({length})"))
        }
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Declared shape of a table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Schema with no query columns; values are stored as opaque payloads.
    pub fn new(table: impl Into<String>) -> Self {
        TableSchema {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }
}

/// Table-name to id assignments for one database.
#[derive(Debug)]
pub struct SchemaRegistry {
    db: String,
    ids: DashMap<String, (u16, u16)>,
}

impl SchemaRegistry {
    pub fn new(db: impl Into<String>) -> Self {
        SchemaRegistry {
            db: db.into(),
            ids: DashMap::new(),
        }
    }

    /// Cached ids of `table`, if it was registered.
    pub fn lookup(&self, table: &str) -> Option<TableRef> {
        self.ids
            .get(table)
            .map(|ids| TableRef::ids(ids.value().0, ids.value().1))
    }

    /// Returns the ids of `schema.table`, registering it on first use.
    pub async fn resolve(&self, pool: &ConnectionPool, schema: &TableSchema) -> ClientResult<TableRef> {
        if let Some(target) = self.lookup(&schema.table) {
            return Ok(target);
        }

        let payload = Bytes::from(serde_json::to_vec(schema)?);
        let body = pool
            .request(
                Op::RegisterSchema,
                TableRef::UNREGISTERED,
                self.db.as_str(),
                payload,
                Flags::SAFE,
            )
            .await?;
        let (db_id, table_id) = wire::decode_schema_ids(&body)?;

        // Concurrent first uses may both register; the server returns the same ids.
        self.ids.insert(schema.table.clone(), (db_id, table_id));
        debug!(db = %self.db, table = %schema.table, db_id, table_id, "schema registered");
        Ok(TableRef::ids(db_id, table_id))
    }
}
