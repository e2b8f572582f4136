//! # Wire Codec
//!
//! Purpose: Encode and decode the length-prefixed frames exchanged with the
//! server, plus the small structured payloads (MGET, TTL prefix, schema ids)
//! that ride inside them.
//!
//! ## Design Principles
//! 1. **Validate Before Writing**: Oversized keys or names fail before a single
//!    byte reaches the output buffer, so a rejected request never leaves a
//!    partial frame behind.
//! 2. **Signed Length Checks**: Every length prefix is read as a signed value
//!    and negative or overrunning lengths become `WireError`, never a panic.
//! 3. **Zero-Copy Decode**: Payloads are sliced out of the frame `Bytes`.
//! 4. **Incremental Framing**: `split_frame` works on a growing read buffer and
//!    returns `None` until a whole frame is present.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WireError, WireResult};
use crate::types::{
    Flags, Op, PushEvent, Request, Response, TableRef, MAX_KEY_LEN, MAX_NAME_LEN, PUSH_ID,
};

/// Size of the outer `u32` length prefix.
pub const LEN_PREFIX: usize = 4;

/// Largest accepted frame body (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Fixed part of a request body: id + op byte.
const REQUEST_HEADER: usize = 8 + 1;

/// Fixed part of a response body: id + status + body length.
const RESPONSE_HEADER: usize = 8 + 4 + 4;

/// Table addressing negotiated for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// Numeric `(dbId, tableId)` pairs from schema registration.
    #[default]
    Compact,
    /// `db` and `table` sent as strings on every request.
    Legacy,
}

/// A decoded server-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Response),
    Push(PushEvent),
}

/// Returns the request body length, validating every bounded field.
pub fn request_body_len(req: &Request) -> WireResult<usize> {
    check_key(&req.key)?;
    let target = match &req.target {
        TableRef::Id { .. } => 2 + 2,
        TableRef::Name { db, table } => {
            check_name(db)?;
            check_name(table)?;
            2 + db.len() + 2 + table.len()
        }
    };
    let len = REQUEST_HEADER + target + 2 + req.key.len() + 4 + req.payload.len();
    if len > MAX_FRAME_LEN {
        return Err(WireError::PayloadTooLarge {
            len: req.payload.len(),
            max: MAX_FRAME_LEN - (len - req.payload.len()),
        });
    }
    Ok(len)
}

/// Appends one length-prefixed request frame to `out`.
///
/// The frame layout follows `req.target`: ids produce the compact format,
/// names the legacy one.
pub fn encode_request(req: &Request, out: &mut BytesMut) -> WireResult<()> {
    let body_len = request_body_len(req)?;
    out.reserve(LEN_PREFIX + body_len);
    out.put_u32(body_len as u32);
    out.put_u64(req.id);
    out.put_u8(req.flags.pack(req.op));
    match &req.target {
        TableRef::Id { db, table } => {
            out.put_u16(*db);
            out.put_u16(*table);
        }
        TableRef::Name { db, table } => {
            put_short_str(out, db);
            put_short_str(out, table);
        }
    }
    put_short_str(out, &req.key);
    put_blob(out, &req.payload);
    Ok(())
}

/// Decodes a request body (without the outer length prefix).
pub fn decode_request(body: Bytes, format: WireFormat) -> WireResult<Request> {
    let mut cur = Cursor::new(body);
    let id = cur.u64()?;
    let (op, flags) = Flags::unpack(cur.u8()?)?;
    let target = match format {
        WireFormat::Compact => TableRef::Id {
            db: cur.u16()?,
            table: cur.u16()?,
        },
        WireFormat::Legacy => TableRef::Name {
            db: cur.short_str("db")?,
            table: cur.short_str("table")?,
        },
    };
    let key = cur.short_str("key")?;
    let payload = cur.blob()?;
    cur.finish()?;
    Ok(Request {
        id,
        op,
        target,
        key,
        payload,
        flags,
    })
}

/// Appends one length-prefixed response frame to `out`.
pub fn encode_response(resp: &Response, out: &mut BytesMut) -> WireResult<()> {
    let body_len = RESPONSE_HEADER + resp.body.len();
    if body_len > MAX_FRAME_LEN {
        return Err(WireError::PayloadTooLarge {
            len: resp.body.len(),
            max: MAX_FRAME_LEN - RESPONSE_HEADER,
        });
    }
    out.reserve(LEN_PREFIX + body_len);
    out.put_u32(body_len as u32);
    out.put_u64(resp.id);
    out.put_u32(resp.status);
    put_blob(out, &resp.body);
    Ok(())
}

/// Decodes a response body (without the outer length prefix).
pub fn decode_response(body: Bytes) -> WireResult<Response> {
    let mut cur = Cursor::new(body);
    let id = cur.u64()?;
    let status = cur.u32()?;
    let body = cur.blob()?;
    cur.finish()?;
    Ok(Response { id, status, body })
}

/// Appends one length-prefixed push frame to `out`.
///
/// Pushes name db and table as strings: the receiver resolves them against
/// its own caches without consulting schema ids.
pub fn encode_push(event: &PushEvent, out: &mut BytesMut) -> WireResult<()> {
    check_name(&event.db)?;
    check_name(&event.table)?;
    check_key(&event.key)?;
    let body_len =
        REQUEST_HEADER + 2 + event.db.len() + 2 + event.table.len() + 2 + event.key.len() + 4;
    out.reserve(LEN_PREFIX + body_len);
    out.put_u32(body_len as u32);
    out.put_u64(PUSH_ID);
    out.put_u8(Flags::NONE.pack(Op::Invalidate));
    put_short_str(out, &event.db);
    put_short_str(out, &event.table);
    put_short_str(out, &event.key);
    put_blob(out, &[]);
    Ok(())
}

/// Decodes a push body (without the outer length prefix).
pub fn decode_push(body: Bytes) -> WireResult<PushEvent> {
    let mut cur = Cursor::new(body);
    let _sentinel = cur.u64()?;
    let op_byte = cur.u8()?;
    if op_byte & Op::CODE_MASK != Op::Invalidate.code() {
        return Err(WireError::UnexpectedPushOp(op_byte));
    }
    let db = cur.short_str("db")?;
    let table = cur.short_str("table")?;
    let key = cur.short_str("key")?;
    let _payload = cur.blob()?;
    cur.finish()?;
    Ok(PushEvent { db, table, key })
}

/// Decodes a server-to-client frame body, telling pushes apart by id.
pub fn decode_frame(body: Bytes) -> WireResult<Frame> {
    if body.len() < 8 {
        return Err(WireError::Truncated {
            needed: 8,
            available: body.len(),
        });
    }
    let id = (&body[..8]).get_u64();
    if id == PUSH_ID {
        decode_push(body).map(Frame::Push)
    } else {
        decode_response(body).map(Frame::Response)
    }
}

/// Splits one complete frame body off the front of a read buffer.
///
/// Returns `Ok(None)` when more bytes are needed; consumed bytes are removed
/// from `buf` only when a whole frame is available.
pub fn split_frame(buf: &mut BytesMut) -> WireResult<Option<Bytes>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    let raw = (&buf[..LEN_PREFIX]).get_i32();
    if raw < 0 {
        return Err(WireError::NegativeLength(raw as i64));
    }
    let len = raw as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }
    if buf.len() < LEN_PREFIX + len {
        buf.reserve(LEN_PREFIX + len - buf.len());
        return Ok(None);
    }
    buf.advance(LEN_PREFIX);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Encodes the key list of a multi-get: `count(4) | [keyLen(2) + key]*`.
pub fn encode_mget_keys<S: AsRef<str>>(keys: &[S]) -> WireResult<Bytes> {
    let mut size = 4;
    for key in keys {
        check_key(key.as_ref())?;
        size += 2 + key.as_ref().len();
    }
    let mut out = BytesMut::with_capacity(size);
    out.put_u32(keys.len() as u32);
    for key in keys {
        put_short_str(&mut out, key.as_ref());
    }
    Ok(out.freeze())
}

/// Decodes a multi-get key list.
pub fn decode_mget_keys(payload: Bytes) -> WireResult<Vec<String>> {
    let mut cur = Cursor::new(payload);
    let count = cur.count()?;
    let mut keys = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        keys.push(cur.short_str("key")?);
    }
    cur.finish()?;
    Ok(keys)
}

/// Encodes multi-get results: `count(4) | [keyLen(2) + key | valueLen(4) + value]*`.
///
/// A missing key is sent with an empty value.
pub fn encode_mget_values(entries: &[(String, Bytes)]) -> WireResult<Bytes> {
    let mut size = 4;
    for (key, value) in entries {
        check_key(key)?;
        size += 2 + key.len() + 4 + value.len();
    }
    let mut out = BytesMut::with_capacity(size);
    out.put_u32(entries.len() as u32);
    for (key, value) in entries {
        put_short_str(&mut out, key);
        put_blob(&mut out, value);
    }
    Ok(out.freeze())
}

/// Decodes multi-get results, skipping keys that came back empty.
pub fn decode_mget_values(body: Bytes) -> WireResult<Vec<(String, Bytes)>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let mut cur = Cursor::new(body);
    let count = cur.count()?;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let key = cur.short_str("key")?;
        let value = cur.blob()?;
        if !value.is_empty() {
            entries.push((key, value));
        }
    }
    cur.finish()?;
    Ok(entries)
}

/// Prefixes a value with its absolute expiry (epoch milliseconds).
pub fn encode_ttl_payload(expires_at_ms: u64, value: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(8 + value.len());
    out.put_u64(expires_at_ms);
    out.put_slice(value);
    out.freeze()
}

/// Splits a TTL-prefixed payload into expiry and value.
pub fn split_ttl_payload(mut payload: Bytes) -> WireResult<(u64, Bytes)> {
    if payload.len() < 8 {
        return Err(WireError::Truncated {
            needed: 8,
            available: payload.len(),
        });
    }
    let expires_at_ms = payload.get_u64();
    Ok((expires_at_ms, payload))
}

/// Encodes a schema registration answer: `dbId(1) | tableId(2)`.
pub fn encode_schema_ids(db: u8, table: u16) -> Bytes {
    let mut out = BytesMut::with_capacity(3);
    out.put_u8(db);
    out.put_u16(table);
    out.freeze()
}

/// Decodes a schema registration answer; extra trailing bytes are ignored.
pub fn decode_schema_ids(body: &[u8]) -> WireResult<(u16, u16)> {
    if body.len() < 3 {
        return Err(WireError::Truncated {
            needed: 3,
            available: body.len(),
        });
    }
    let mut buf = body;
    let db = buf.get_u8() as u16;
    let table = buf.get_u16();
    Ok((db, table))
}

fn check_key(key: &str) -> WireResult<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(WireError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

fn check_name(name: &str) -> WireResult<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

// Callers validate lengths first; the casts below cannot truncate.
fn put_short_str(out: &mut BytesMut, value: &str) {
    out.put_u16(value.len() as u16);
    out.put_slice(value.as_bytes());
}

fn put_blob(out: &mut BytesMut, value: &[u8]) {
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

/// Bounds-checked reader over a frame body.
struct Cursor {
    buf: Bytes,
}

impl Cursor {
    fn new(buf: Bytes) -> Self {
        Cursor { buf }
    }

    fn need(&self, needed: usize) -> WireResult<()> {
        if self.buf.remaining() < needed {
            return Err(WireError::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> WireResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> WireResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> WireResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> WireResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn count(&mut self) -> WireResult<usize> {
        self.need(4)?;
        let raw = self.buf.get_i32();
        if raw < 0 {
            return Err(WireError::NegativeLength(raw as i64));
        }
        Ok(raw as usize)
    }

    fn take(&mut self, len: usize) -> WireResult<Bytes> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn short_str(&mut self, field: &'static str) -> WireResult<String> {
        self.need(2)?;
        let raw = self.buf.get_i16();
        if raw < 0 {
            return Err(WireError::NegativeLength(raw as i64));
        }
        let bytes = self.take(raw as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
    }

    fn blob(&mut self) -> WireResult<Bytes> {
        let len = self.count()?;
        self.take(len)
    }

    fn finish(self) -> WireResult<()> {
        if self.buf.has_remaining() {
            return Err(WireError::TrailingBytes(self.buf.remaining()));
        }
        Ok(())
    }
}
