//! # Client Benchmark Harness
//!
//! Purpose: Drive a running Arbor server through the client transport so
//! pipelined throughput and latency can be compared over time. A cache-only
//! phase measures the client cache without touching the network.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use fixed PRNG seeds for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys/values to keep setup costs off the hot path.
//! 3. **Pipelined Load**: Many tasks share the pool so requests overlap on each socket.
//!
//! Usage: `arbor-bench [keys] [ops] [concurrency] [value_size]`; the server
//! address and every transport tunable come from `ARBOR_*` variables.

use std::env;
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use arbor_client::{CacheConfig, Client, ClientCache, ClientConfig, MetricsSnapshot, Table};
use bytes::Bytes;
use tracing::info;

const DEFAULT_KEY_COUNT: usize = 1 << 14;
const DEFAULT_OP_COUNT: usize = 200_000;
const DEFAULT_CONCURRENCY: usize = 64;
const DEFAULT_VALUE_SIZE: usize = 128;

struct BenchConfig {
    requested_keys: usize,
    key_count: usize,
    key_mask: usize,
    op_count: usize,
    concurrency: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let requested_keys = parse_usize(args.next(), DEFAULT_KEY_COUNT);
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let concurrency = parse_usize(args.next(), DEFAULT_CONCURRENCY).max(1);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);

        let key_count = normalize_power_of_two(requested_keys);
        BenchConfig {
            requested_keys,
            key_count,
            key_mask: key_count - 1,
            op_count,
            concurrency,
            value_size,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn normalize_power_of_two(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

/// XorShift keeps the workload reproducible without pulling in a PRNG crate.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn build_keys(count: usize) -> Arc<Vec<String>> {
    Arc::new((0..count).map(|i| format!("bench:{i:08}")).collect())
}

fn build_value(size: usize, seed: u64) -> Bytes {
    let mut value = vec![0u8; size];
    for (i, byte) in value.iter_mut().enumerate() {
        *byte = (seed >> ((i % 8) * 8)) as u8 ^ i as u8;
    }
    Bytes::from(value)
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

/// Upper bucket bound holding the given quantile of samples.
fn quantile_bound_us(metrics: &MetricsSnapshot, quantile: f64) -> Option<u64> {
    let latency = &metrics.latency;
    let target = (latency.samples as f64 * quantile).ceil() as u64;
    let mut seen = 0;
    for (idx, count) in latency.buckets.iter().enumerate() {
        seen += count;
        if seen >= target {
            return latency.bounds_us.get(idx).copied();
        }
    }
    None
}

fn report_metrics(metrics: &MetricsSnapshot) {
    let p99 = quantile_bound_us(metrics, 0.99)
        .map(|us| format!("<= {us}us"))
        .unwrap_or_else(|| "overflow".to_string());
    println!(
        "requests={} errors={} pipeline_full={} reconnects={} flushes={} mean={:?} p99 {p99}",
        metrics.requests_total,
        metrics.errors_total,
        metrics.pipeline_full_total,
        metrics.reconnects_total,
        metrics.flushes_total,
        metrics.latency.mean(),
    );
}

/// Spreads `ops` operations over `concurrency` tasks and waits for all of them.
async fn run_phase<F, Fut>(config: &BenchConfig, seed: u64, op: F) -> anyhow::Result<()>
where
    F: Fn(usize) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let per_task = config.op_count / config.concurrency;
    let mut tasks = Vec::with_capacity(config.concurrency);
    for task in 0..config.concurrency {
        let op = op.clone();
        let mask = config.key_mask;
        tasks.push(tokio::spawn(async move {
            let mut rng = XorShift64::new(seed ^ (task as u64 + 1));
            for _ in 0..per_task {
                op(rng.next_index(mask)).await?;
            }
            anyhow::Ok(())
        }));
    }
    for task in tasks {
        task.await.context("bench task panicked")??;
    }
    Ok(())
}

async fn bench_network(config: &BenchConfig, client: &Client) -> anyhow::Result<()> {
    let table: Table<Bytes> = client.table("bench").await.context("open bench table")?;
    let keys = build_keys(config.key_count);
    let value = build_value(config.value_size, 0x5A5A_5A5A_5A5A_5A5A);

    let start = Instant::now();
    for key in keys.iter() {
        table.set(key, value.clone()).await?;
    }
    report("PRELOAD", config.key_count, start.elapsed());

    let ops = (config.op_count / config.concurrency) * config.concurrency;

    let start = Instant::now();
    let (get_table, get_keys) = (table.clone(), Arc::clone(&keys));
    run_phase(config, 0x1234_5678_9ABC_DEF0, move |idx| {
        let (table, keys) = (get_table.clone(), Arc::clone(&get_keys));
        async move {
            black_box(table.get(&keys[idx]).await?);
            anyhow::Ok(())
        }
    })
    .await?;
    report("GET", ops, start.elapsed());

    let start = Instant::now();
    let (set_table, set_keys) = (table.clone(), Arc::clone(&keys));
    run_phase(config, 0x0FED_CBA9_8765_4321, move |idx| {
        let (table, keys, value) = (set_table.clone(), Arc::clone(&set_keys), value.clone());
        async move {
            table.set(&keys[idx], value).await?;
            anyhow::Ok(())
        }
    })
    .await?;
    report("SET", ops, start.elapsed());

    Ok(())
}

fn bench_cache(config: &BenchConfig) {
    let cache = ClientCache::<Bytes>::new(&CacheConfig {
        enabled: true,
        max_size: config.key_count,
        ttl: Duration::from_secs(600),
        stats: true,
    });
    let keys = build_keys(config.key_count);
    let value = build_value(config.value_size, 0xA5A5_A5A5_A5A5_A5A5);
    for key in keys.iter() {
        cache.insert(key, value.clone());
    }

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let start = Instant::now();
    for _ in 0..config.op_count {
        black_box(cache.get(&keys[rng.next_index(config.key_mask)]));
    }
    report("CACHE GET", config.op_count, start.elapsed());

    if let Some(stats) = cache.stats() {
        println!(
            "cache: hits={} misses={} evictions={} hit_rate={:.3}",
            stats.hits,
            stats.misses,
            stats.evictions,
            stats.hit_rate()
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = BenchConfig::from_args();
    println!(
        "keys: requested={}, actual={}, ops={}, concurrency={}, value_size={}",
        config.requested_keys,
        config.key_count,
        config.op_count,
        config.concurrency,
        config.value_size
    );

    bench_cache(&config);

    let client_config = ClientConfig::from_env().context("client configuration")?;
    info!(addr = %client_config.addr, pool = client_config.pool_size, "connecting");
    let client = Client::connect(client_config)
        .await
        .context("connect to server")?;

    let outcome = bench_network(&config, &client).await;
    report_metrics(&client.metrics());
    client.stop().await;
    outcome
}
