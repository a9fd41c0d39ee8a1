// Numan Thabit 2025
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use predict_batcher::{
    backend::HttpBackend,
    config::{CliArgs, Config},
    metrics::BatcherMetrics,
    server,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = CliArgs::parse();
    let config = Config::from_cli(&cli)?;
    let metrics = Arc::new(BatcherMetrics::new()?);
    let upstream = Arc::new(HttpBackend::new(
        config.upstream.clone(),
        config.upstream_timeout,
    )?);

    let shutdown = CancellationToken::new();
    let state = server::build_state(&config, upstream, metrics.clone(), shutdown.clone())?;
    let engine = state.engine.clone();

    let metrics_task = config.metrics_listen.map(|addr| {
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = server::serve_metrics(addr, metrics, shutdown).await {
                error!(error = %err, "metrics endpoint failed");
            }
        })
    });
    let signal_task = tokio::spawn(server::shutdown_signal(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .context("failed to bind listen socket")?;
    info!(
        listen = %config.listen,
        upstream = %config.upstream,
        batching = engine.is_some(),
        "predict-batcher listening"
    );

    let app = server::router(state, config.http_trace);
    let served = server::serve(listener, app, shutdown.clone()).await;
    shutdown.cancel();

    if let Some(engine) = engine {
        if !engine.drain(config.shutdown_grace).await {
            warn!(grace = ?config.shutdown_grace, "in-flight batches did not finish before exit");
        }
    }
    signal_task.abort();
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    served?;
    info!("shutdown complete");
    Ok(())
}
