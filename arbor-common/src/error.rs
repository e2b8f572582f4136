//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire protocol operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while encoding or decoding frames.
///
/// Any decode error is fatal to the session that produced the bytes: the
/// stream position can no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Key exceeds the signed 16-bit length prefix.
    #[error("key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    /// Database or table name exceeds the signed 16-bit length prefix.
    #[error("name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    /// Payload does not fit in a single frame.
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// A length prefix decoded to a negative value.
    #[error("negative length prefix: {0}")]
    NegativeLength(i64),

    /// Outer frame length exceeds the protocol limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame body ended before a field was complete.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Bytes left over after the last field of a frame.
    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),

    /// Op byte did not map to a known operation.
    #[error("unknown op code: 0x{0:02x}")]
    UnknownOp(u8),

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Push frame carried something other than the invalidate op.
    #[error("push frame with unexpected op code 0x{0:02x}")]
    UnexpectedPushOp(u8),
}
