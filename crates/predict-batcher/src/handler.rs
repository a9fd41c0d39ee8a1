// Numan Thabit 2025
//! HTTP front door: batches predict routes and passes everything else through.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{BackendError, HttpBackend};
use crate::batch::{BatchResponse, PredictRequest};
use crate::engine::BatchEngine;
use crate::metrics::BatcherMetrics;

const PREDICT_SUFFIX: &str = "predict";

#[derive(Clone)]
pub struct AppState {
    /// `None` when batching is disabled; every request then passes through.
    pub engine: Option<BatchEngine>,
    pub upstream: Arc<HttpBackend>,
    pub metrics: Arc<BatcherMetrics>,
    pub idle_timeout: Duration,
    pub max_request_bytes: usize,
    pub shutdown: CancellationToken,
}

/// Routes whose path ends in `predict` are batched.
pub fn is_predict_route(path: &str) -> bool {
    path.ends_with(PREDICT_SUFFIX)
}

pub async fn front_door(State(state): State<AppState>, request: Request) -> Response {
    match state.engine.as_ref() {
        Some(engine) if is_predict_route(request.uri().path()) => {
            batched(&state, engine, request).await
        }
        _ => pass_through(&state, request).await,
    }
}

async fn batched(state: &AppState, engine: &BatchEngine, request: Request) -> Response {
    let path = request.uri().path().to_string();
    if exceeds_limit(&request, state.max_request_bytes) {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request exceeds configured limit",
        );
    }

    let body = match to_bytes(request.into_body(), state.max_request_bytes).await {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, path = %path, "failed to read predict body");
            return error_response(StatusCode::BAD_REQUEST, "cannot read request body");
        }
    };
    let decoded = match PredictRequest::from_slice(&body) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(error = %err, path = %path, "failed to decode predict body");
            return error_response(StatusCode::BAD_REQUEST, "cannot decode request body");
        }
    };

    let rx = match engine.submit(decoded.queries, &path) {
        Ok(rx) => rx,
        Err(err) => return error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
    };

    tokio::select! {
        biased;
        delivered = rx => match delivered {
            Ok(response) => json_response(&response),
            Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "batcher is shutting down"),
        },
        _ = state.shutdown.cancelled() => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "batcher is shutting down")
        }
        _ = tokio::time::sleep(state.idle_timeout) => {
            state.metrics.record_timeout();
            debug!(path = %path, timeout = ?state.idle_timeout, "predict request timed out");
            error_response(StatusCode::REQUEST_TIMEOUT, "request timeout")
        }
    }
}

async fn pass_through(state: &AppState, request: Request) -> Response {
    if exceeds_limit(&request, state.max_request_bytes) {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request exceeds configured limit",
        );
    }
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_request_bytes).await {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, "failed to read pass-through body");
            return error_response(StatusCode::BAD_REQUEST, "cannot read request body");
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    state.metrics.record_pass_through();

    match state
        .upstream
        .pass_through(parts.method, path_and_query, &parts.headers, body)
        .await
    {
        Ok(reply) => {
            let mut response = Response::new(Body::from(reply.body));
            *response.status_mut() = reply.status;
            *response.headers_mut() = reply.headers;
            response
        }
        Err(err) => {
            warn!(error = %err, path = %path_and_query, "pass-through request failed");
            let status = match err {
                BackendError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                BackendError::Path { .. } => StatusCode::BAD_REQUEST,
                BackendError::Request(_) => StatusCode::BAD_GATEWAY,
            };
            error_response(status, &err.to_string())
        }
    }
}

fn exceeds_limit(request: &Request, limit: usize) -> bool {
    request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .is_some_and(|len| len > limit)
}

fn json_response(response: &BatchResponse) -> Response {
    match serde_json::to_vec(response) {
        Ok(body) => (StatusCode::OK, [(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        message.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predict_suffix_selects_batched_routes() {
        assert!(is_predict_route("/predict"));
        assert!(is_predict_route("/v1/models/resnet:predict"));
        assert!(is_predict_route("/predictpredict"));
        assert!(!is_predict_route("/predict/"));
        assert!(!is_predict_route("/predictNoBatcher"));
        assert!(!is_predict_route("/"));
    }

    #[test]
    fn declared_body_size_is_checked_against_limit() {
        let request = Request::builder()
            .header(CONTENT_LENGTH, "2048")
            .body(Body::empty())
            .expect("request");
        assert!(exceeds_limit(&request, 1024));
        assert!(!exceeds_limit(&request, 4096));
    }
}
