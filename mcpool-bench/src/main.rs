//! Load driver for the connection pool.
//!
//! Usage: `mcpool-bench [config.json] [threads] [requests-per-thread]`
//!
//! Each request checks out a connection, sends `version`, reads the reply
//! line and returns the connection. Without a config file the pool targets
//! `127.0.0.1:11211` with default settings.

use std::env;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use mcpool_client::{ConnectionPool, PoolConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_HOST: &str = "127.0.0.1:11211";

#[derive(Debug, Default, Clone, Copy)]
struct WorkerTotals {
    ok: u64,
    unavailable: u64,
    failed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = env::args().skip(1);
    let config = match args.next() {
        Some(path) => load_config(&path)?,
        None => PoolConfig::new([DEFAULT_HOST]),
    };
    let threads = parse_arg(args.next(), 4).context("invalid thread count")?;
    let requests = parse_arg(args.next(), 1000).context("invalid request count")?;
    if threads == 0 {
        bail!("thread count must be at least 1");
    }

    let pool = ConnectionPool::new();
    pool.initialize(config).context("failed to initialize pool")?;

    let started = Instant::now();
    let workers: Vec<_> = (0..threads)
        .map(|worker| {
            let pool = pool.clone();
            thread::Builder::new()
                .name(format!("bench-{worker}"))
                .spawn(move || run_worker(&pool, worker, requests))
                .context("failed to spawn worker")
        })
        .collect::<Result<_>>()?;

    let mut totals = WorkerTotals::default();
    for worker in workers {
        let result = match worker.join() {
            Ok(result) => result,
            Err(_) => bail!("worker thread panicked"),
        };
        totals.ok += result.ok;
        totals.unavailable += result.unavailable;
        totals.failed += result.failed;
    }
    let elapsed = started.elapsed();

    report(&pool, totals, elapsed);
    pool.shutdown();
    Ok(())
}

fn load_config(path: &str) -> Result<PoolConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    PoolConfig::from_json(&text).with_context(|| format!("invalid pool config in {path}"))
}

fn parse_arg(value: Option<String>, default: usize) -> Result<usize> {
    match value {
        Some(value) => value.parse().with_context(|| format!("`{value}` is not a number")),
        None => Ok(default),
    }
}

fn run_worker(pool: &ConnectionPool, worker: usize, requests: usize) -> WorkerTotals {
    let mut totals = WorkerTotals::default();
    for request in 0..requests {
        let key = format!("bench:{worker}:{request}");
        let Some(mut conn) = pool.checkout(&key) else {
            totals.unavailable += 1;
            continue;
        };

        let reply = conn
            .write(b"version\r\n")
            .and_then(|()| conn.flush())
            .and_then(|()| conn.read_line());
        match reply {
            Ok(_) => totals.ok += 1,
            Err(err) => {
                warn!(worker, host = conn.host(), error = %err, "request failed");
                conn.discard();
                totals.failed += 1;
            }
        }
    }
    totals
}

fn report(pool: &ConnectionPool, totals: WorkerTotals, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        ok = totals.ok,
        unavailable = totals.unavailable,
        failed = totals.failed,
        elapsed_ms = elapsed.as_millis() as u64,
        requests_per_sec = (totals.ok as f64 / secs) as u64,
        "bench finished"
    );
    for host in pool.stats() {
        info!(
            host = %host.host,
            available = host.available,
            busy = host.busy,
            dead = host.dead,
            "host stats"
        );
    }
}
