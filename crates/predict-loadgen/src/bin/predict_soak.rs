// Numan Thabit 2025
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Steady-rate predict load generator for predict-batcher")]
struct Args {
    /// Predict endpoint (e.g., http://127.0.0.1:9081/predict)
    #[arg(long, default_value = "http://127.0.0.1:9081/predict")]
    endpoint: String,

    /// Steady RPS target
    #[arg(long, default_value_t = 200u64)]
    rps: u64,

    /// Test duration seconds
    #[arg(long, default_value_t = 30u64)]
    duration_secs: u64,

    /// Max in-flight requests
    #[arg(long, default_value_t = 512usize)]
    inflight_max: usize,

    /// Query text sent in each request (repeat to cycle through several).
    #[arg(long = "query", value_name = "TEXT", action = clap::ArgAction::Append)]
    queries: Vec<String>,

    /// Number of queries packed into each request.
    #[arg(long, default_value_t = 1usize)]
    queries_per_request: usize,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Ok,
    Failed,
    Timeout,
    Error,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let queries = if args.queries.is_empty() {
        vec!["Hello, how are you doing today?".to_string()]
    } else {
        args.queries.clone()
    };

    let client = reqwest::Client::builder()
        .tcp_keepalive(Some(Duration::from_secs(15)))
        .pool_max_idle_per_host(args.inflight_max)
        .build()
        .context("failed to build http client")?;

    let period = if args.rps > 0 {
        Duration::from_nanos(1_000_000_000u64 / args.rps)
    } else {
        Duration::from_millis(1)
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(endpoint = %args.endpoint, rps = args.rps, duration_secs = args.duration_secs, "starting soak");

    let end = Instant::now() + Duration::from_secs(args.duration_secs);
    let sem = Arc::new(Semaphore::new(args.inflight_max));
    let mut tasks = JoinSet::new();
    let mut skipped = 0u64;
    let mut seq = 0usize;

    while Instant::now() < end {
        ticker.tick().await;
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        let batch: Vec<&str> = (0..args.queries_per_request)
            .map(|offset| queries[(seq + offset) % queries.len()].as_str())
            .collect();
        seq += args.queries_per_request;
        let body = serde_json::json!({ "queries": batch });
        let client = client.clone();
        let url = args.endpoint.clone();
        tasks.spawn(async move {
            let start = Instant::now();
            let outcome = match client.post(&url).json(&body).send().await {
                Ok(rsp) if rsp.status() == reqwest::StatusCode::REQUEST_TIMEOUT => Outcome::Timeout,
                Ok(rsp) if rsp.status().is_success() => {
                    match rsp.json::<serde_json::Value>().await {
                        Ok(value) if !value["predictions"].is_null() => Outcome::Ok,
                        _ => Outcome::Failed,
                    }
                }
                Ok(_) => Outcome::Failed,
                Err(_) => Outcome::Error,
            };
            drop(permit);
            (outcome, start.elapsed().as_secs_f64() * 1_000.0)
        });
    }

    let mut lat_ms: Vec<f64> = Vec::with_capacity((args.rps * args.duration_secs) as usize);
    let (mut ok, mut failed, mut timeouts, mut errors) = (0u64, 0u64, 0u64, 0u64);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((outcome, elapsed)) => {
                lat_ms.push(elapsed);
                match outcome {
                    Outcome::Ok => ok += 1,
                    Outcome::Failed => failed += 1,
                    Outcome::Timeout => timeouts += 1,
                    Outcome::Error => errors += 1,
                }
            }
            Err(err) => warn!(error = %err, "request task panicked"),
        }
    }

    if !lat_ms.is_empty() {
        lat_ms.sort_by(|a, b| a.total_cmp(b));
        let p = |q: f64| percentile(&lat_ms, q);
        println!(
            "p50={:.2}ms p95={:.2}ms p99={:.2}ms p99.9={:.2}ms N={} ok={} failed={} timeout={} error={} skipped={} rps={} inflight={}",
            p(50.0),
            p(95.0),
            p(99.0),
            p(99.9),
            lat_ms.len(),
            ok,
            failed,
            timeouts,
            errors,
            skipped,
            args.rps,
            args.inflight_max
        );
    }
    Ok(())
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len() as f64;
    let rank = (p / 100.0) * (n - 1.0);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - (lo as f64);
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
