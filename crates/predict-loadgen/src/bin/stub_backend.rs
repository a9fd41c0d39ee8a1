// Numan Thabit 2025
//! Toy inference service: one prediction per query, optionally slow or flaky.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Stub inference service for exercising predict-batcher")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: SocketAddr,

    /// Fixed cost per call in milliseconds, independent of batch size.
    #[arg(long, default_value_t = 50u64)]
    delay_ms: u64,

    /// Reply with HTTP 500 on every Nth call (0 disables).
    #[arg(long, default_value_t = 0u64)]
    fail_every: u64,
}

#[derive(Debug, Deserialize)]
struct PredictionRequestBody {
    queries: Vec<Value>,
}

#[derive(Clone)]
struct Service {
    delay: Duration,
    fail_every: u64,
    calls: Arc<AtomicU64>,
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
    let svc = Service {
        delay: Duration::from_millis(args.delay_ms),
        fail_every: args.fail_every,
        calls: Arc::new(AtomicU64::new(0)),
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/predict", post(predict))
        .route("/predictNoBatcher", post(predict))
        .with_state(svc);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .context("failed to bind stub backend")?;
    info!(listen = %args.listen, delay_ms = args.delay_ms, fail_every = args.fail_every, "stub backend listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("stub backend exited with error")?;
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({ "Hello": "World" }))
}

async fn predict(State(svc): State<Service>, Json(req): Json<PredictionRequestBody>) -> Response {
    let call = svc.calls.fetch_add(1, Ordering::Relaxed) + 1;
    let start = Instant::now();
    tokio::time::sleep(svc.delay).await;

    if svc.fail_every > 0 && call % svc.fail_every == 0 {
        debug!(call, "injecting failure");
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }

    let predictions: Vec<Value> = req
        .queries
        .iter()
        .map(|query| json!({ "input": query, "label": "POSITIVE", "score": 0.98 }))
        .collect();
    let total = start.elapsed().as_secs_f64();
    debug!(call, batch = predictions.len(), "served batch");
    Json(json!({
        "metrics": {
            "InferenceTime": total,
            "TotalTime": total,
            "BatchSize": predictions.len(),
        },
        "predictions": predictions,
    }))
    .into_response()
}
