//! # Request/Response Type Definitions
//!
//! Core message types exchanged between the client and the data store over a
//! persistent TCP session.
//!
//! ## Design Principles
//!
//! 1. **Compact Addressing**: Tables are addressed by 16-bit ids assigned at
//!    schema registration; string addressing survives only as the legacy format.
//! 2. **Opaque Payloads**: Values travel as `Bytes`; what they mean is decided
//!    by the payload codec above this crate.
//! 3. **Correlation by Id**: Every request carries a per-connection id which the
//!    response echoes, so responses may arrive in any order.
//! 4. **Empty Means Absent**: A zero-length payload or body is the wire form of
//!    "no value".
//!
//! ## Memory Layout Example
//!
//! ```text
//! Request body (compact format):
//! +-------+-------------+---------+----------+-------------+-----------------+
//! | id:8B | op|flags:1B | db:2B   | table:2B | keyLen:2B + | payloadLen:4B + |
//! |       |             |         |          | key         | payload         |
//! +-------+-------------+---------+----------+-------------+-----------------+
//!
//! op|flags byte:
//! +---------+---------+----------------+
//! | bit 7   | bit 6   | bits 0-5       |
//! | ttl     | safe    | op code        |
//! +---------+---------+----------------+
//!
//! Response body:
//! +-------+-----------+------------------+
//! | id:8B | status:4B | bodyLen:4B + body|
//! +-------+-----------+------------------+
//! ```

use std::fmt;

use bytes::Bytes;

use crate::error::{WireError, WireResult};

/// Request id reserved for server-pushed invalidations (`-1` as `i64`).
pub const PUSH_ID: u64 = u64::MAX;

/// Maximum key length in bytes; the length prefix is a signed 16-bit value.
pub const MAX_KEY_LEN: usize = i16::MAX as usize;

/// Maximum database/table name length for string addressing.
pub const MAX_NAME_LEN: usize = i16::MAX as usize;

/// First status code treated as an application error.
pub const STATUS_ERROR_MIN: u32 = 400;

/// Operation carried in the low six bits of the op byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get = 0,
    Set = 1,
    Delete = 2,
    Exists = 3,
    Mget = 4,
    QueryGet = 10,
    QueryUpdate = 11,
    QueryDelete = 12,
    QueryCount = 13,
    RegisterSchema = 20,
    Subscribe = 21,
    /// Only appears in server pushes.
    Invalidate = 63,
}

impl Op {
    /// Mask selecting the op code bits of the op byte.
    pub const CODE_MASK: u8 = 0x3F;

    /// Returns the six-bit wire code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Maps a six-bit wire code back to an operation.
    pub fn from_code(code: u8) -> WireResult<Self> {
        let op = match code {
            0 => Op::Get,
            1 => Op::Set,
            2 => Op::Delete,
            3 => Op::Exists,
            4 => Op::Mget,
            10 => Op::QueryGet,
            11 => Op::QueryUpdate,
            12 => Op::QueryDelete,
            13 => Op::QueryCount,
            20 => Op::RegisterSchema,
            21 => Op::Subscribe,
            63 => Op::Invalidate,
            other => return Err(WireError::UnknownOp(other)),
        };
        Ok(op)
    }

    /// True for operations that mutate stored data.
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            Op::Set | Op::Delete | Op::QueryUpdate | Op::QueryDelete
        )
    }

    /// Upper-case symbol, used in logs.
    pub const fn symbol(self) -> &'static str {
        match self {
            Op::Get => "GET",
            Op::Set => "SET",
            Op::Delete => "DELETE",
            Op::Exists => "EXISTS",
            Op::Mget => "MGET",
            Op::QueryGet => "QUERY_GET",
            Op::QueryUpdate => "QUERY_UPDATE",
            Op::QueryDelete => "QUERY_DELETE",
            Op::QueryCount => "QUERY_COUNT",
            Op::RegisterSchema => "REGISTER_SCHEMA",
            Op::Subscribe => "SUBSCRIBE",
            Op::Invalidate => "INVALIDATE",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Per-request flag bits.
///
/// Only two bits exist on the wire; they share the op byte with the op code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    /// No flags set.
    pub const NONE: Flags = Flags(0);
    /// Durable ("safe") write: the server acknowledges after the write is durable.
    pub const SAFE: Flags = Flags(0x01);
    /// Payload starts with an 8-byte absolute expiry in epoch milliseconds.
    pub const TTL_PREFIXED: Flags = Flags(0x02);

    const ALL: u8 = 0x03;
    const SHIFT: u32 = 6;

    /// Builds flags from raw bits, dropping anything outside the two defined bits.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Flags(bits & Self::ALL)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Flags) -> Self {
        Flags(self.0 | other.0)
    }

    /// Packs op code and flags into the single op byte.
    pub const fn pack(self, op: Op) -> u8 {
        op.code() | (self.0 << Self::SHIFT)
    }

    /// Splits an op byte into op code and flags.
    pub fn unpack(byte: u8) -> WireResult<(Op, Flags)> {
        let op = Op::from_code(byte & Op::CODE_MASK)?;
        Ok((op, Flags(byte >> Self::SHIFT)))
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.union(rhs)
    }
}

/// How a request names its target table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableRef {
    /// Compact ids from schema registration (canonical path).
    Id { db: u16, table: u16 },
    /// Legacy string addressing, used before ids are negotiated.
    Name { db: String, table: String },
}

impl TableRef {
    /// Addressing used by control requests that precede registration.
    pub const UNREGISTERED: TableRef = TableRef::Id { db: 0, table: 0 };

    pub fn ids(db: u16, table: u16) -> Self {
        TableRef::Id { db, table }
    }

    pub fn names(db: impl Into<String>, table: impl Into<String>) -> Self {
        TableRef::Name {
            db: db.into(),
            table: table.into(),
        }
    }
}

/// One client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Per-connection correlation id.
    pub id: u64,
    pub op: Op,
    pub target: TableRef,
    pub key: String,
    /// Opaque value bytes; empty when the op carries none.
    pub payload: Bytes,
    pub flags: Flags,
}

/// Server answer to exactly one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Echo of the request id.
    pub id: u64,
    /// 0-399 success, 400 and above application error.
    pub status: u32,
    /// Opaque body; empty means "no value".
    pub body: Bytes,
}

impl Response {
    pub fn ok(id: u64, body: impl Into<Bytes>) -> Self {
        Response {
            id,
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status >= STATUS_ERROR_MIN
    }
}

/// Unsolicited invalidation notice pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub db: String,
    pub table: String,
    /// Empty key invalidates the whole table.
    pub key: String,
}

impl PushEvent {
    pub fn new(db: impl Into<String>, table: impl Into<String>, key: impl Into<String>) -> Self {
        PushEvent {
            db: db.into(),
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn is_table_wide(&self) -> bool {
        self.key.is_empty()
    }
}
