//! Value encoding at the edge of the transport.
//!
//! The transport only moves opaque bytes. `Payload` converts table values to
//! and from those bytes: the four primitive types use the tagged fast-path,
//! `Bytes` passes through untouched and `Json<T>` covers any serde type.

use arbor_common::Primitive;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ClientError, ClientResult};

/// A value that can be stored in a table.
pub trait Payload: Sized + Send + Sync + 'static {
    fn to_payload(&self) -> ClientResult<Bytes>;

    /// Decodes a non-empty payload; empty bodies mean "missing" and never reach here.
    fn from_payload(bytes: Bytes) -> ClientResult<Self>;
}

fn mismatch(expected: &str) -> ClientError {
    ClientError::Payload(format!("payload is not a tagged {expected}"))
}

impl Payload for String {
    fn to_payload(&self) -> ClientResult<Bytes> {
        Ok(Primitive::Str(self.clone()).encode())
    }

    fn from_payload(bytes: Bytes) -> ClientResult<Self> {
        match Primitive::decode(&bytes) {
            Some(Primitive::Str(value)) => Ok(value),
            _ => Err(mismatch("string")),
        }
    }
}

impl Payload for i32 {
    fn to_payload(&self) -> ClientResult<Bytes> {
        Ok(Primitive::Int(*self).encode())
    }

    fn from_payload(bytes: Bytes) -> ClientResult<Self> {
        match Primitive::decode(&bytes) {
            Some(Primitive::Int(value)) => Ok(value),
            _ => Err(mismatch("int32")),
        }
    }
}

impl Payload for i64 {
    fn to_payload(&self) -> ClientResult<Bytes> {
        Ok(Primitive::Long(*self).encode())
    }

    fn from_payload(bytes: Bytes) -> ClientResult<Self> {
        match Primitive::decode(&bytes) {
            Some(Primitive::Long(value)) => Ok(value),
            // Narrow values written by an int32 producer still read back.
            Some(Primitive::Int(value)) => Ok(value as i64),
            _ => Err(mismatch("int64")),
        }
    }
}

impl Payload for bool {
    fn to_payload(&self) -> ClientResult<Bytes> {
        Ok(Primitive::Bool(*self).encode())
    }

    fn from_payload(bytes: Bytes) -> ClientResult<Self> {
        match Primitive::decode(&bytes) {
            Some(Primitive::Bool(value)) => Ok(value),
            _ => Err(mismatch("bool")),
        }
    }
}

impl Payload for Bytes {
    fn to_payload(&self) -> ClientResult<Bytes> {
        Ok(self.clone())
    }

    fn from_payload(bytes: Bytes) -> ClientResult<Self> {
        Ok(bytes)
    }
}

/// Stores any serde type as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Payload for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn to_payload(&self) -> ClientResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }

    fn from_payload(bytes: Bytes) -> ClientResult<Self> {
        Ok(Json(serde_json::from_slice(&bytes)?))
    }
}
