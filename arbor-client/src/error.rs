//! Client error taxonomy.

use std::time::Duration;

use arbor_common::WireError;
use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
///
/// `Clone` because a single connection failure is delivered to every request
/// pending on that connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Socket broken, closed or not yet re-established.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame; the session that produced it is torn down.
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Request rejected before it was written, e.g. a key over the wire limit.
    /// Nothing was sent and the session is unaffected.
    #[error("invalid request: {0}")]
    InvalidRequest(WireError),

    /// Server answered with status >= 400.
    #[error("server error {status}: {message}")]
    Application { status: u32, message: String },

    /// No pipeline permit became free in time.
    #[error("pipeline full: {limit} requests in flight, waited {waited:?}")]
    PipelineFull { limit: usize, waited: Duration },

    /// Handshake rejected or impossible.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Connection was stopped before the request completed.
    #[error("connection stopped")]
    Shutdown,

    /// Value could not be converted to or from its payload bytes.
    #[error("payload codec error: {0}")]
    Payload(String),

    /// Invalid configuration or address.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        ClientError::Transport(err.to_string())
    }

    /// True when resubmitting the same request may succeed.
    ///
    /// Application errors are the server's verdict and are never retryable
    /// from this layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::PipelineFull { .. } | ClientError::Auth(_)
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Payload(err.to_string())
    }
}
