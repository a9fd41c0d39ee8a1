// Numan Thabit 2025
//! In-flight batch bookkeeping: the accumulated queries, the callers waiting on
//! them and the expiry timer that bounds how long the batch may stay open.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// One opaque inference input. The batcher never looks inside it.
pub type Query = Value;

/// Body accepted on predict routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub queries: Vec<Query>,
}

impl PredictRequest {
    /// Decode a request body. Only a JSON object (or `null`) is accepted; the
    /// derived impl alone would also take a positional array like `[[1, 2]]`.
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        let object: serde_json::Map<String, Value> = serde_json::from_slice(body)?;
        serde_json::from_value(Value::Object(object))
    }
}

/// Body sent to the inference service for a combined batch.
#[derive(Debug, Serialize)]
pub(crate) struct OutboundRequest<'a> {
    pub queries: &'a [Query],
}

/// Reply shape expected from the inference service.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionReply {
    #[serde(default)]
    pub predictions: Option<Vec<Value>>,
    #[serde(default)]
    pub metrics: Value,
}

/// Payload handed back to a single caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub message: String,
    pub predictions: Option<Vec<Value>>,
    #[serde(default)]
    pub metrics: Value,
}

impl BatchResponse {
    pub const SUCCESS_MESSAGE: &'static str = "Successful";

    pub fn success(predictions: Vec<Value>, metrics: Value) -> Self {
        Self {
            message: Self::SUCCESS_MESSAGE.to_string(),
            predictions: Some(predictions),
            metrics,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            predictions: None,
            metrics: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.predictions.is_some()
    }
}

/// One caller's claim on a contiguous slice of a batch.
///
/// Dropping a subscriber without calling [`Subscriber::deliver`] closes its
/// channel, which the waiting caller observes as a release without a value.
#[derive(Debug)]
pub struct Subscriber {
    range: Range<usize>,
    tx: oneshot::Sender<BatchResponse>,
}

impl Subscriber {
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Consume the subscriber, delivering its single message. Returns `false`
    /// when the caller already stopped waiting.
    pub fn deliver(self, response: BatchResponse) -> bool {
        self.tx.send(response).is_ok()
    }
}

/// Queries accumulated for one downstream call.
#[derive(Debug)]
pub struct Batch {
    id: u64,
    path: String,
    queries: Vec<Query>,
    subscribers: Vec<Subscriber>,
    expiry: Option<AbortHandle>,
}

impl Batch {
    pub(crate) fn open(id: u64, path: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            queries: Vec::new(),
            subscribers: Vec::new(),
            expiry: None,
        }
    }

    /// Append a caller's queries and hand back the receiving half of its channel.
    /// The new subscriber's range starts where the previous one ended.
    pub(crate) fn admit(&mut self, queries: Vec<Query>) -> oneshot::Receiver<BatchResponse> {
        let start = self.queries.len();
        self.queries.extend(queries);
        let (tx, rx) = oneshot::channel();
        self.subscribers.push(Subscriber {
            range: start..self.queries.len(),
            tx,
        });
        rx
    }

    pub(crate) fn arm_expiry(&mut self, handle: AbortHandle) {
        self.expiry = Some(handle);
    }

    /// Cancel the expiry timer, if one is still armed.
    pub(crate) fn disarm(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.abort();
        }
    }

    /// Forget the expiry timer without aborting it; used from the timer itself.
    pub(crate) fn clear_expiry(&mut self) {
        self.expiry = None;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    pub fn subscribers(&self) -> &[Subscriber] {
        &self.subscribers
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub(crate) fn into_parts(mut self) -> (String, Vec<Query>, Vec<Subscriber>) {
        self.disarm();
        (
            std::mem::take(&mut self.path),
            std::mem::take(&mut self.queries),
            std::mem::take(&mut self.subscribers),
        )
    }

    /// Release every subscriber without a value, newest first.
    pub(crate) fn close(self) -> usize {
        let (_, _, mut subscribers) = self.into_parts();
        let released = subscribers.len();
        while let Some(subscriber) = subscribers.pop() {
            drop(subscriber);
        }
        released
    }
}
