// Numan Thabit 2025
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::Url;
use serde::Deserialize;
use tracing::info;

const DEFAULT_LISTEN_PORT: u16 = 9081;
const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:8000";
const DEFAULT_CONFIG_PATH: &str = "ops/predict-batcher.toml";
const DEFAULT_ENABLE_BATCHING: bool = true;
const DEFAULT_MAX_BATCH_SIZE: usize = 32;
const DEFAULT_MAX_LATENCY_MS: u64 = 2_000;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 0;
const DEFAULT_MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Micro-batching agent in front of a single inference service",
    rename_all = "kebab-case"
)]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(long, value_name = "PATH", env = "PREDICT_BATCHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Socket address to bind the HTTP ingress server on.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Base URL of the inference service.
    #[arg(long)]
    pub upstream: Option<Url>,

    /// Batch predict requests (false passes every request straight through).
    #[arg(long)]
    pub enable_batching: Option<bool>,

    /// Maximum number of queries combined into one downstream call.
    #[arg(long)]
    pub max_batch_size: Option<usize>,

    /// Longest a query may wait for its batch to fill, in milliseconds.
    #[arg(long)]
    pub max_latency_ms: Option<u64>,

    /// Longest a caller waits for its result, in milliseconds.
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Deadline for each upstream call in milliseconds (0 disables timeout).
    #[arg(long)]
    pub upstream_timeout_ms: Option<u64>,

    /// Maximum accepted request body size in bytes.
    #[arg(long)]
    pub max_request_bytes: Option<usize>,

    /// Optional separate listener serving Prometheus metrics at /metrics.
    #[arg(long)]
    pub metrics_listen: Option<SocketAddr>,

    /// How long to wait for in-flight batches on shutdown, in milliseconds.
    #[arg(long)]
    pub shutdown_grace_ms: Option<u64>,

    /// Enable per-request HTTP tracing logs (adds overhead; default off).
    #[arg(long, default_value_t = false)]
    pub http_trace: bool,
}

/// Limits governing batch accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Ceiling on queries per batch.
    pub max_batch_size: usize,
    /// Upper bound on how long a batch stays open.
    pub max_latency: Duration,
    /// Upper bound on how long a caller waits for its result.
    pub idle_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_latency: Duration::from_millis(DEFAULT_MAX_LATENCY_MS),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_batch_size > 0, "max_batch_size must be > 0");
        anyhow::ensure!(!self.max_latency.is_zero(), "max_latency must be > 0");
        anyhow::ensure!(!self.idle_timeout.is_zero(), "idle_timeout must be > 0");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub upstream: Url,
    pub batch: Option<BatchConfig>,
    pub upstream_timeout: Option<Duration>,
    pub max_request_bytes: usize,
    pub metrics_listen: Option<SocketAddr>,
    pub shutdown_grace: Duration,
    pub http_trace: bool,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<SocketAddr>,
    upstream: Option<String>,
    enable_batching: Option<bool>,
    max_batch_size: Option<usize>,
    max_latency_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    upstream_timeout_ms: Option<u64>,
    max_request_bytes: Option<usize>,
    metrics_listen: Option<SocketAddr>,
    shutdown_grace_ms: Option<u64>,
    http_trace: Option<bool>,
}

impl Config {
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let file_cfg =
            load_file_config(cli.config.as_deref()).context("failed to load config file")?;
        let config = merge(cli, file_cfg)?;
        config.validate()?;
        config.log_summary();
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.upstream.scheme(), "http" | "https") {
            bail!("upstream must use http or https, got {}", self.upstream);
        }
        if self.max_request_bytes == 0 {
            bail!("max_request_bytes must be greater than 0");
        }
        if let Some(batch) = &self.batch {
            batch.validate()?;
        }
        Ok(())
    }

    fn log_summary(&self) {
        info!(
            listen = %self.listen,
            upstream = %self.upstream,
            batching = self.batch.is_some(),
            max_batch_size = self.batch.map(|b| b.max_batch_size),
            max_latency = ?self.batch.map(|b| b.max_latency),
            idle_timeout = ?self.batch.map(|b| b.idle_timeout),
            upstream_timeout = ?self.upstream_timeout,
            max_request_bytes = self.max_request_bytes,
            metrics_listen = ?self.metrics_listen,
            http_trace = self.http_trace,
            "predict-batcher configuration"
        );
    }
}

fn merge(cli: &CliArgs, file_cfg: Option<(PathBuf, FileConfig)>) -> Result<Config> {
    let (cfg_path, file_cfg) = file_cfg.unzip();
    let file_cfg = file_cfg.unwrap_or_default();

    let listen = pick(
        cli.listen,
        file_cfg.listen,
        SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
    );

    let file_upstream = file_cfg
        .upstream
        .as_deref()
        .map(Url::parse)
        .transpose()
        .context("invalid upstream url in config file")?;
    let upstream = match cli.upstream.clone().or(file_upstream) {
        Some(url) => url,
        None => Url::parse(DEFAULT_UPSTREAM).context("invalid default upstream url")?,
    };

    let enable_batching = pick(
        cli.enable_batching,
        file_cfg.enable_batching,
        DEFAULT_ENABLE_BATCHING,
    );
    let batch = if enable_batching {
        let max_batch_size = pick(
            cli.max_batch_size,
            file_cfg.max_batch_size,
            DEFAULT_MAX_BATCH_SIZE,
        );
        let max_latency_ms = pick(
            cli.max_latency_ms,
            file_cfg.max_latency_ms,
            DEFAULT_MAX_LATENCY_MS,
        );
        let idle_timeout_ms = pick(
            cli.idle_timeout_ms,
            file_cfg.idle_timeout_ms,
            DEFAULT_IDLE_TIMEOUT_MS,
        );
        Some(BatchConfig {
            max_batch_size,
            max_latency: Duration::from_millis(max_latency_ms),
            idle_timeout: Duration::from_millis(idle_timeout_ms),
        })
    } else {
        None
    };

    let upstream_timeout_ms = pick(
        cli.upstream_timeout_ms,
        file_cfg.upstream_timeout_ms,
        DEFAULT_UPSTREAM_TIMEOUT_MS,
    );
    let upstream_timeout = if upstream_timeout_ms == 0 {
        None
    } else {
        Some(Duration::from_millis(upstream_timeout_ms))
    };

    let max_request_bytes = pick(
        cli.max_request_bytes,
        file_cfg.max_request_bytes,
        DEFAULT_MAX_REQUEST_BYTES,
    );
    let metrics_listen = cli.metrics_listen.or(file_cfg.metrics_listen);
    let shutdown_grace_ms = pick(
        cli.shutdown_grace_ms,
        file_cfg.shutdown_grace_ms,
        DEFAULT_SHUTDOWN_GRACE_MS,
    );
    let http_trace = cli.http_trace || file_cfg.http_trace.unwrap_or(false);

    Ok(Config {
        listen,
        upstream,
        batch,
        upstream_timeout,
        max_request_bytes,
        metrics_listen,
        shutdown_grace: Duration::from_millis(shutdown_grace_ms),
        http_trace,
        config_path: cfg_path,
    })
}

fn pick<T: Clone>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

fn load_file_config(path: Option<&Path>) -> Result<Option<(PathBuf, FileConfig)>> {
    if let Some(path) = path {
        return read_config(path).map(|cfg| Some((path.to_path_buf(), cfg)));
    }

    let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        return read_config(&default_path).map(|cfg| Some((default_path, cfg)));
    }

    Ok(None)
}

fn read_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        bail!("config file {} does not exist", path.display());
    }
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg: FileConfig = toml::from_str(&data)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(cfg)
}
