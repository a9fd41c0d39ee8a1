// Numan Thabit 2025
//! Issues the combined downstream call for a detached batch and fans the
//! result back out to every subscriber.

use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError};
use crate::batch::{Batch, BatchResponse, OutboundRequest, PredictionReply, Query, Subscriber};
use crate::metrics::BatcherMetrics;

/// Reasons a combined call could not be split back into per-caller slices.
/// The `Display` text is what every subscriber of the batch receives.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("unable to encode batch for inference service: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("inference service unreachable: {0}")]
    Transport(#[from] BackendError),
    #[error("inference service replied with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unable to decode inference service response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error(
        "length of response from inference service ({actual}) does not match queries ({expected})"
    )]
    LengthMismatch { expected: usize, actual: usize },
}

impl ForwardError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ForwardError::Encode(_) => "encode",
            ForwardError::Transport(_) => "transport",
            ForwardError::Status { .. } => "status",
            ForwardError::Decode(_) => "decode",
            ForwardError::LengthMismatch { .. } => "length_mismatch",
        }
    }
}

struct Predictions {
    values: Vec<Value>,
    metrics: Value,
}

#[derive(Clone)]
pub struct Forwarder {
    backend: Arc<dyn Backend>,
    metrics: Arc<BatcherMetrics>,
}

impl Forwarder {
    pub fn new(backend: Arc<dyn Backend>, metrics: Arc<BatcherMetrics>) -> Self {
        Self { backend, metrics }
    }

    /// Send `batch` downstream and deliver exactly one message to each subscriber.
    pub async fn forward(&self, batch: Batch) {
        let batch_id = batch.id();
        let (path, queries, subscribers) = batch.into_parts();

        let start = Instant::now();
        let outcome = self.call(&path, &queries).await;
        self.metrics.record_backend_latency(start.elapsed());

        match outcome {
            Ok(predictions) => {
                debug!(
                    batch_id,
                    path = %path,
                    queries = queries.len(),
                    subscribers = subscribers.len(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "batch completed"
                );
                deliver_slices(batch_id, subscribers, predictions);
            }
            Err(err) => {
                self.metrics.record_batch_failure(err.reason());
                match err {
                    ForwardError::Decode(_) | ForwardError::LengthMismatch { .. } => warn!(
                        batch_id,
                        path = %path,
                        queries = queries.len(),
                        error = %err,
                        "inference service broke the batch contract"
                    ),
                    _ => warn!(batch_id, path = %path, error = %err, "batch forward failed"),
                }
                fan_out(batch_id, subscribers, BatchResponse::failure(err.to_string()));
            }
        }
    }

    async fn call(&self, path: &str, queries: &[Query]) -> Result<Predictions, ForwardError> {
        let body = serde_json::to_vec(&OutboundRequest { queries }).map_err(ForwardError::Encode)?;
        let reply = self.backend.call(path, Bytes::from(body)).await?;

        if !reply.status.is_success() {
            return Err(ForwardError::Status {
                status: reply.status,
                body: String::from_utf8_lossy(&reply.body).trim().to_string(),
            });
        }

        let decoded: PredictionReply =
            serde_json::from_slice(&reply.body).map_err(ForwardError::Decode)?;
        let values = decoded.predictions.unwrap_or_default();
        if values.len() != queries.len() {
            return Err(ForwardError::LengthMismatch {
                expected: queries.len(),
                actual: values.len(),
            });
        }

        Ok(Predictions {
            values,
            metrics: decoded.metrics,
        })
    }
}

fn deliver_slices(batch_id: u64, subscribers: Vec<Subscriber>, predictions: Predictions) {
    for subscriber in subscribers.into_iter().rev() {
        let slice = predictions.values[subscriber.range()].to_vec();
        let response = BatchResponse::success(slice, predictions.metrics.clone());
        if !subscriber.deliver(response) {
            debug!(batch_id, "subscriber left before delivery");
        }
    }
}

fn fan_out(batch_id: u64, subscribers: Vec<Subscriber>, response: BatchResponse) {
    for subscriber in subscribers.into_iter().rev() {
        if !subscriber.deliver(response.clone()) {
            debug!(batch_id, "subscriber left before delivery");
        }
    }
}
