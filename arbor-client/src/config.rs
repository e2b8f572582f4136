//! # Client Configuration
//!
//! Every tunable of the transport in one plain struct. `Default` carries the
//! production values; `from_env` overlays `ARBOR_*` variables so deployments
//! can retune without a rebuild.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use arbor_common::WireFormat;

use crate::error::{ClientError, ClientResult};

/// Client-side cache settings, applied per table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Enables the read cache and push invalidation subscriptions.
    pub enabled: bool,
    /// Maximum entries per table before LRU eviction.
    pub max_size: usize,
    /// Time-to-live of each cached entry.
    pub ttl: Duration,
    /// Records hit/miss/eviction counters.
    pub stats: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: false,
            max_size: 5000,
            ttl: Duration::from_secs(60),
            stats: false,
        }
    }
}

/// Configuration for the client, its pool and every pooled connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:4533".
    pub addr: String,
    /// Database name this client works in.
    pub db: String,
    /// Shared secret for the HMAC handshake; required only when the server asks.
    pub secret: Option<String>,
    /// Number of pooled connections.
    pub pool_size: usize,
    /// Maximum in-flight requests per connection.
    pub pipeline_limit: usize,
    /// How long `send` waits for a pipeline permit.
    pub permit_timeout: Duration,
    /// Buffered bytes that force an immediate flush.
    pub flush_threshold: usize,
    /// Upper bound on how long a buffered frame waits for the flush timer.
    pub flush_interval: Duration,
    /// Flush immediately when at most this many requests are in flight.
    /// Zero disables the low-load fast path.
    pub eager_flush_pending: usize,
    /// Socket send buffer size (bytes).
    pub send_buffer: u32,
    /// Socket receive buffer size (bytes).
    pub recv_buffer: u32,
    /// Timeout for TCP connect plus handshake.
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles up to `reconnect_backoff_max`.
    pub reconnect_backoff: Duration,
    pub reconnect_backoff_max: Duration,
    /// Table addressing on the wire.
    pub wire_format: WireFormat,
    /// Sets the durable-write flag on writes.
    pub safe_writes: bool,
    pub cache: CacheConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:4533".to_string(),
            db: "default".to_string(),
            secret: None,
            pool_size: 4,
            pipeline_limit: 100,
            permit_timeout: Duration::from_secs(5),
            flush_threshold: 64 * 1024,
            flush_interval: Duration::from_millis(1),
            eager_flush_pending: 2,
            send_buffer: 128 * 1024,
            recv_buffer: 128 * 1024,
            connect_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_millis(100),
            reconnect_backoff_max: Duration::from_secs(5),
            wire_format: WireFormat::Compact,
            safe_writes: true,
            cache: CacheConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Builds a configuration from defaults plus `ARBOR_*` environment overrides.
    ///
    /// Unset variables keep their default; malformed values are an error.
    pub fn from_env() -> ClientResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ClientResult<Self> {
        let mut config = ClientConfig::default();
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(addr) = get("ARBOR_ADDR") {
            config.addr = addr;
        }
        if let Some(db) = get("ARBOR_DB") {
            config.db = db;
        }
        if let Some(secret) = get("ARBOR_SECRET") {
            config.secret = Some(secret);
        }
        override_parsed(&get, "ARBOR_POOL_SIZE", &mut config.pool_size)?;
        override_parsed(&get, "ARBOR_PIPELINE_MAX", &mut config.pipeline_limit)?;
        override_parsed(&get, "ARBOR_WRITE_FLUSH_THRESHOLD", &mut config.flush_threshold)?;
        override_millis(&get, "ARBOR_WRITE_FLUSH_INTERVAL_MS", &mut config.flush_interval)?;
        override_parsed(&get, "ARBOR_EAGER_FLUSH_PENDING", &mut config.eager_flush_pending)?;
        override_parsed(&get, "ARBOR_SOCKET_SEND_BUFFER", &mut config.send_buffer)?;
        override_parsed(&get, "ARBOR_SOCKET_RECV_BUFFER", &mut config.recv_buffer)?;
        override_parsed(&get, "ARBOR_SAFE_WRITES", &mut config.safe_writes)?;
        override_parsed(&get, "ARBOR_CACHE_ENABLED", &mut config.cache.enabled)?;
        override_parsed(&get, "ARBOR_CACHE_MAX_SIZE", &mut config.cache.max_size)?;
        override_parsed(&get, "ARBOR_CACHE_STATS", &mut config.cache.stats)?;
        if let Some(raw) = get("ARBOR_CACHE_TTL_SECS") {
            let secs: u64 = parse_value("ARBOR_CACHE_TTL_SECS", &raw)?;
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(raw) = get("ARBOR_WIRE_FORMAT") {
            config.wire_format = match raw.trim().to_ascii_lowercase().as_str() {
                "compact" => WireFormat::Compact,
                "legacy" => WireFormat::Legacy,
                other => {
                    return Err(ClientError::Config(format!(
                        "ARBOR_WIRE_FORMAT: unknown format {other:?}"
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the transport cannot run with.
    pub fn validate(&self) -> ClientResult<()> {
        if self.pool_size == 0 {
            return Err(ClientError::Config("pool_size must be at least 1".into()));
        }
        if self.pipeline_limit == 0 {
            return Err(ClientError::Config(
                "pipeline_limit must be at least 1".into(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ClientError::Config("flush_interval must be non-zero".into()));
        }
        if self.reconnect_backoff.is_zero() {
            return Err(ClientError::Config("reconnect_backoff must be non-zero".into()));
        }
        if self.cache.enabled && self.cache.max_size == 0 {
            return Err(ClientError::Config(
                "cache.max_size must be at least 1 when the cache is enabled".into(),
            ));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> ClientResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| ClientError::Config(format!("{name}: cannot parse {raw:?}")))
}

fn override_parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) -> ClientResult<()> {
    if let Some(raw) = get(name) {
        *slot = parse_value(name, &raw)?;
    }
    Ok(())
}

fn override_millis(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut Duration,
) -> ClientResult<()> {
    if let Some(raw) = get(name) {
        *slot = Duration::from_millis(parse_value(name, &raw)?);
    }
    Ok(())
}
