//! # Primitive Fast-Path Payloads
//!
//! Strings, 32/64-bit integers and booleans are by far the most common stored
//! values. They get a fixed two-byte header (`MAGIC`, type tag) instead of a
//! round trip through a general object codec.
//!
//! ```text
//! string  : 0xBF 0x01 len:1B (<128)        utf8
//!           0xBF 0x01 len:4B (high bit set) utf8
//! int32   : 0xBF 0x02 value:4B
//! int64   : 0xBF 0x03 value:8B
//! bool    : 0xBF 0x04 0x00|0x01
//! ```
//!
//! Anything that does not start with `MAGIC` belongs to another codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Marker byte opening every fast-path payload.
pub const MAGIC: u8 = 0xBF;

const TAG_STRING: u8 = 0x01;
const TAG_INT32: u8 = 0x02;
const TAG_INT64: u8 = 0x03;
const TAG_BOOL: u8 = 0x04;

/// Strings shorter than this use a one-byte length.
const SHORT_STRING: usize = 128;
const LONG_LEN_BIT: u32 = 0x8000_0000;

/// A value eligible for the primitive fast-path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    Str(String),
    Int(i32),
    Long(i64),
    Bool(bool),
}

impl Primitive {
    /// Encodes the value with its marker and tag.
    pub fn encode(&self) -> Bytes {
        match self {
            Primitive::Str(value) => {
                let len = value.len();
                let mut out = BytesMut::with_capacity(2 + 4 + len);
                out.put_u8(MAGIC);
                out.put_u8(TAG_STRING);
                if len < SHORT_STRING {
                    out.put_u8(len as u8);
                } else {
                    out.put_u32(len as u32 | LONG_LEN_BIT);
                }
                out.put_slice(value.as_bytes());
                out.freeze()
            }
            Primitive::Int(value) => {
                let mut out = BytesMut::with_capacity(6);
                out.put_u8(MAGIC);
                out.put_u8(TAG_INT32);
                out.put_i32(*value);
                out.freeze()
            }
            Primitive::Long(value) => {
                let mut out = BytesMut::with_capacity(10);
                out.put_u8(MAGIC);
                out.put_u8(TAG_INT64);
                out.put_i64(*value);
                out.freeze()
            }
            Primitive::Bool(value) => Bytes::copy_from_slice(&[MAGIC, TAG_BOOL, u8::from(*value)]),
        }
    }

    /// Decodes a fast-path payload.
    ///
    /// Returns `None` when the bytes are not fast-path encoded or are
    /// malformed, so the caller can hand them to the general codec.
    pub fn decode(bytes: &[u8]) -> Option<Primitive> {
        if bytes.len() < 2 || bytes[0] != MAGIC {
            return None;
        }
        let mut rest = &bytes[2..];
        match bytes[1] {
            TAG_STRING => {
                let first = *rest.first()?;
                let len = if first & 0x80 == 0 {
                    rest.advance(1);
                    first as usize
                } else {
                    if rest.len() < 4 {
                        return None;
                    }
                    (rest.get_u32() & !LONG_LEN_BIT) as usize
                };
                let text = rest.get(..len)?;
                String::from_utf8(text.to_vec()).ok().map(Primitive::Str)
            }
            TAG_INT32 if rest.len() >= 4 => Some(Primitive::Int(rest.get_i32())),
            TAG_INT64 if rest.len() >= 8 => Some(Primitive::Long(rest.get_i64())),
            TAG_BOOL if !rest.is_empty() => Some(Primitive::Bool(rest[0] != 0)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_strings() {
        let short = Primitive::Str("hi".to_string()).encode();
        assert_eq!(&short[..], &[MAGIC, TAG_STRING, 2, b'h', b'i']);

        let text = "x".repeat(300);
        let long = Primitive::Str(text.clone()).encode();
        assert_eq!(long[2] & 0x80, 0x80);
        assert_eq!(long.len(), 2 + 4 + 300);
        assert_eq!(Primitive::decode(&long), Some(Primitive::Str(text)));
    }

    #[test]
    fn integers_are_big_endian() {
        let encoded = Primitive::Int(0x0102_0304).encode();
        assert_eq!(&encoded[..], &[MAGIC, TAG_INT32, 1, 2, 3, 4]);
        assert_eq!(
            Primitive::decode(&Primitive::Long(-5).encode()),
            Some(Primitive::Long(-5))
        );
    }

    #[test]
    fn bools() {
        assert_eq!(Primitive::decode(&[MAGIC, TAG_BOOL, 1]), Some(Primitive::Bool(true)));
        assert_eq!(Primitive::decode(&[MAGIC, TAG_BOOL, 0]), Some(Primitive::Bool(false)));
    }

    #[test]
    fn foreign_or_short_bytes_fall_through() {
        assert_eq!(Primitive::decode(b"{\"a\":1}"), None);
        assert_eq!(Primitive::decode(&[MAGIC, TAG_INT64, 0, 0]), None);
        assert_eq!(Primitive::decode(&[MAGIC, 0x7F, 0]), None);
    }
}
