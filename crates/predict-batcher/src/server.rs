// Numan Thabit 2025
//! Router assembly, listeners and shutdown plumbing.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::backend::HttpBackend;
use crate::config::Config;
use crate::engine::BatchEngine;
use crate::handler::{front_door, AppState};
use crate::metrics::BatcherMetrics;

/// Build the front door state. When batching is enabled this also starts the
/// engine's lifecycle supervisor on `shutdown`.
pub fn build_state(
    config: &Config,
    upstream: Arc<HttpBackend>,
    metrics: Arc<BatcherMetrics>,
    shutdown: CancellationToken,
) -> Result<AppState> {
    let engine = match config.batch {
        Some(batch) => {
            let engine = BatchEngine::new(batch, upstream.clone(), metrics.clone())
                .context("invalid batch configuration")?;
            engine.spawn_supervisor(shutdown.clone());
            Some(engine)
        }
        None => {
            info!("batching disabled; all requests pass through");
            None
        }
    };

    Ok(AppState {
        engine,
        upstream,
        metrics,
        idle_timeout: config
            .batch
            .map(|batch| batch.idle_timeout)
            .unwrap_or_default(),
        max_request_bytes: config.max_request_bytes,
        shutdown,
    })
}

pub fn router(state: AppState, http_trace: bool) -> Router {
    let mut app = Router::new().fallback(front_door).with_state(state);
    if http_trace {
        app = app.layer(TraceLayer::new_for_http());
    }
    app
}

/// Serve `app` until `shutdown` is cancelled, then finish in-flight requests.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("axum server exited with error")
}

/// Expose Prometheus metrics on a dedicated listener.
pub async fn serve_metrics(
    bind: SocketAddr,
    metrics: Arc<BatcherMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind metrics listener {bind}"))?;
    info!(addr = %bind, "metrics endpoint ready");
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    serve(listener, app, shutdown).await
}

async fn metrics_handler(State(metrics): State<Arc<BatcherMetrics>>) -> (StatusCode, String) {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            warn!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Cancel `shutdown` on ctrl-c or SIGTERM.
pub async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => return,
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
