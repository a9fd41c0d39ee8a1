// Numan Thabit 2025
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use prometheus::{
    exponential_buckets, opts, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec,
    Registry, TextEncoder,
};

pub struct BatcherMetrics {
    registry: Registry,
    requests: IntCounter,
    queries: IntCounter,
    rejected: IntCounter,
    timeouts: IntCounter,
    pass_through: IntCounter,
    batches: IntCounterVec,
    batch_failures: IntCounterVec,
    batch_size: Histogram,
    backend_latency: Histogram,
}

impl BatcherMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("predict_batcher".into()), None)
            .context("failed to create metrics registry")?;

        let requests = IntCounter::with_opts(opts!(
            "requests_admitted_total",
            "Predict requests admitted into a batch"
        ))
        .context("failed to build requests counter")?;
        let queries = IntCounter::with_opts(opts!(
            "queries_admitted_total",
            "Individual queries admitted into a batch"
        ))
        .context("failed to build queries counter")?;
        let rejected = IntCounter::with_opts(opts!(
            "requests_rejected_total",
            "Predict requests rejected because the batcher is stopping"
        ))
        .context("failed to build rejected counter")?;
        let timeouts = IntCounter::with_opts(opts!(
            "request_timeouts_total",
            "Callers that gave up before their batch completed"
        ))
        .context("failed to build timeouts counter")?;
        let pass_through = IntCounter::with_opts(opts!(
            "pass_through_requests_total",
            "Requests forwarded upstream without batching"
        ))
        .context("failed to build pass-through counter")?;
        let batches = IntCounterVec::new(
            opts!("batches_forwarded_total", "Batches handed to the forwarder"),
            &["trigger"],
        )
        .context("failed to build batches counter")?;
        let batch_failures = IntCounterVec::new(
            opts!(
                "batch_failures_total",
                "Batches whose downstream call failed, by reason"
            ),
            &["reason"],
        )
        .context("failed to build batch failures counter")?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size_queries", "Queries per forwarded batch").buckets(
                exponential_buckets(1.0, 2.0, 10).context("failed to build size buckets")?,
            ),
        )
        .context("failed to build batch size histogram")?;
        let backend_latency = Histogram::with_opts(
            HistogramOpts::new(
                "backend_latency_seconds",
                "Round-trip latency of combined downstream calls",
            )
            .buckets(
                exponential_buckets(1e-3, 2.0, 16).context("failed to build latency buckets")?,
            ),
        )
        .context("failed to build backend latency histogram")?;

        registry
            .register(Box::new(requests.clone()))
            .context("register requests")?;
        registry
            .register(Box::new(queries.clone()))
            .context("register queries")?;
        registry
            .register(Box::new(rejected.clone()))
            .context("register rejected")?;
        registry
            .register(Box::new(timeouts.clone()))
            .context("register timeouts")?;
        registry
            .register(Box::new(pass_through.clone()))
            .context("register pass-through")?;
        registry
            .register(Box::new(batches.clone()))
            .context("register batches")?;
        registry
            .register(Box::new(batch_failures.clone()))
            .context("register batch failures")?;
        registry
            .register(Box::new(batch_size.clone()))
            .context("register batch size")?;
        registry
            .register(Box::new(backend_latency.clone()))
            .context("register backend latency")?;

        Ok(Self {
            registry,
            requests,
            queries,
            rejected,
            timeouts,
            pass_through,
            batches,
            batch_failures,
            batch_size,
            backend_latency,
        })
    }

    pub fn record_admitted(&self, queries: usize) {
        self.requests.inc();
        self.queries.inc_by(queries as u64);
    }

    pub fn record_rejected(&self) {
        self.rejected.inc();
    }

    pub fn record_timeout(&self) {
        self.timeouts.inc();
    }

    pub fn record_pass_through(&self) {
        self.pass_through.inc();
    }

    pub fn record_batch(&self, trigger: &str, queries: usize) {
        self.batches.with_label_values(&[trigger]).inc();
        self.batch_size.observe(queries as f64);
    }

    pub fn record_backend_latency(&self, latency: Duration) {
        self.backend_latency.observe(latency.as_secs_f64());
    }

    pub fn record_batch_failure(&self, reason: &str) {
        self.batch_failures.with_label_values(&[reason]).inc();
    }

    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::with_capacity(4096);
        encoder
            .encode(&metric_families, &mut buf)
            .context("failed to encode metrics")?;
        String::from_utf8(buf).map_err(|err| anyhow!("metrics output not utf8: {err}"))
    }
}
