//! # Client Metrics
//!
//! Lightweight counters and a latency histogram describing what the transport
//! is doing: request volume, failures, back-pressure, reconnects and pushes.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply.
//! 2. **Fixed Buckets**: Histogram buckets live in a contiguous array.
//! 3. **Snapshot Reads**: Readers get plain structs, never live atomics.
//!
//! ## Notes
//! - One `ClientMetrics` is shared by every connection of a pool.
//! - Latency is measured from frame registration to response delivery, so it
//!   includes time spent in the write buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] =
    [50, 100, 200, 500, 1_000, 2_000, 5_000, 10_000, 20_000, 50_000, 100_000, 500_000];

/// Snapshot of all client metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Requests handed to a connection.
    pub requests_total: u64,
    /// Requests that resolved with any error.
    pub errors_total: u64,
    /// Sends rejected because no pipeline permit freed up in time.
    pub pipeline_full_total: u64,
    /// Sessions re-established after a failure.
    pub reconnects_total: u64,
    /// Invalidation pushes received.
    pub pushes_total: u64,
    /// Socket writes of the write buffer.
    pub flushes_total: u64,
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    pub samples: u64,
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Mean latency, or zero with no samples.
    pub fn mean(&self) -> Duration {
        if self.samples == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sum_us / self.samples)
    }
}

/// Thread-safe metrics aggregator.
///
/// `Ordering::Relaxed` is enough: no reader needs cross-field consistency.
#[derive(Debug)]
pub struct ClientMetrics {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    pipeline_full_total: AtomicU64,
    reconnects_total: AtomicU64,
    pushes_total: AtomicU64,
    flushes_total: AtomicU64,
    latency: LatencyHistogram,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// Creates an aggregator with custom bucket boundaries (ascending, microseconds).
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        ClientMetrics {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            pipeline_full_total: AtomicU64::new(0),
            reconnects_total: AtomicU64::new(0),
            pushes_total: AtomicU64::new(0),
            flushes_total: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed request with its latency.
    pub fn record_response(&self, latency: Duration, is_error: bool) {
        if is_error {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency);
    }

    /// Records a request failed without a response (transport, shutdown, write error).
    pub fn record_failure(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_full(&self) {
        self.pipeline_full_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push(&self) {
        self.pushes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            pipeline_full_total: self.pipeline_full_total.load(Ordering::Relaxed),
            reconnects_total: self.reconnects_total.load(Ordering::Relaxed),
            pushes_total: self.pushes_total.load(Ordering::Relaxed),
            flushes_total: self.flushes_total.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Fixed-bucket latency histogram.
///
/// Bucket selection is a linear scan; the list is short and stays hot in cache.
#[derive(Debug)]
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with `bounds_us.len() + 1` buckets (last is overflow).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}
