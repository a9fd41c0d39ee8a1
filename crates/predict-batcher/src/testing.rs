// Numan Thabit 2025
//! In-process backend double for unit tests.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::backend::{Backend, BackendError, BackendReply};
use crate::batch::{PredictRequest, Query};

type Script = Box<dyn Fn(&[Query]) -> BackendReply + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub path: String,
    pub queries: Vec<Query>,
    pub at: Instant,
}

pub(crate) struct ScriptedBackend {
    script: Option<Script>,
    delay: Duration,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn with<F>(script: F) -> Self
    where
        F: Fn(&[Query]) -> BackendReply + Send + Sync + 'static,
    {
        Self {
            script: Some(Box::new(script)),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(status: StatusCode, body: Value) -> Self {
        let body = Bytes::from(body.to_string());
        Self::with(move |_| BackendReply {
            status,
            body: body.clone(),
        })
    }

    /// One `{"echo": query}` prediction per query.
    pub fn echo() -> Self {
        Self::with(|queries| {
            let predictions: Vec<Value> = queries.iter().map(|q| json!({ "echo": q })).collect();
            BackendReply {
                status: StatusCode::OK,
                body: Bytes::from(json!({ "predictions": predictions }).to_string()),
            }
        })
    }

    /// Every call fails at the transport level.
    pub fn failing() -> Self {
        Self {
            script: None,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn call(&self, path: &str, body: Bytes) -> Result<BackendReply, BackendError> {
        let request: PredictRequest =
            serde_json::from_slice(&body).expect("batcher sends well-formed requests");
        self.calls.lock().push(RecordedCall {
            path: path.to_string(),
            queries: request.queries.clone(),
            at: Instant::now(),
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.script {
            Some(script) => Ok(script(&request.queries)),
            None => Err(BackendError::Timeout(Duration::from_millis(1))),
        }
    }
}
