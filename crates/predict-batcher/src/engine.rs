// Numan Thabit 2025
//! Admission control for the micro-batcher.
//!
//! All state lives behind one mutex: the single open batch, the lifecycle and
//! the count of batches still being forwarded. Admission, both flush triggers
//! and shutdown take that lock; the downstream call never runs under it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::backend::Backend;
use crate::batch::{Batch, BatchResponse, Query};
use crate::config::BatchConfig;
use crate::forward::Forwarder;
use crate::metrics::BatcherMetrics;

/// Lifecycle of the engine. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting submissions.
    Running,
    /// Rejecting submissions; batches already handed to the forwarder are finishing.
    Stopping,
    /// Nothing left in flight.
    Stopped,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("batcher is shutting down")]
    Stopped,
}

/// What caused a batch to leave the admission path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    /// The append that just happened reached `max_batch_size`.
    Size,
    /// The open batch could not take the incoming submission without exceeding the ceiling.
    Overflow,
    /// The batch stayed open for `max_latency`.
    Latency,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Overflow => "overflow",
            FlushTrigger::Latency => "latency",
        }
    }
}

struct EngineState {
    current: Option<Batch>,
    lifecycle: Lifecycle,
    next_id: u64,
    in_flight: usize,
}

struct EngineInner {
    config: BatchConfig,
    forwarder: Forwarder,
    metrics: Arc<BatcherMetrics>,
    state: Mutex<EngineState>,
    drained: Notify,
}

/// Handle to the shared batch engine. Cloning is cheap.
#[derive(Clone)]
pub struct BatchEngine {
    inner: Arc<EngineInner>,
}

impl BatchEngine {
    pub fn new(
        config: BatchConfig,
        backend: Arc<dyn Backend>,
        metrics: Arc<BatcherMetrics>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                forwarder: Forwarder::new(backend, metrics.clone()),
                metrics,
                state: Mutex::new(EngineState {
                    current: None,
                    lifecycle: Lifecycle::Running,
                    next_id: 1,
                    in_flight: 0,
                }),
                drained: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Number of queries in the open batch, if one is open.
    pub fn open_batch_len(&self) -> Option<usize> {
        self.inner.state.lock().current.as_ref().map(Batch::len)
    }

    /// Admit `queries` into the open batch (or a new one) and return the channel
    /// on which exactly one response, or a bare close on shutdown, will arrive.
    ///
    /// Must be called from within a tokio runtime: flushing spawns the forwarder
    /// and opening a batch arms its expiry timer.
    pub fn submit(
        &self,
        queries: Vec<Query>,
        path: &str,
    ) -> Result<oneshot::Receiver<BatchResponse>, SubmitError> {
        let max = self.inner.config.max_batch_size;
        let incoming = queries.len();
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if state.lifecycle != Lifecycle::Running {
            self.inner.metrics.record_rejected();
            return Err(SubmitError::Stopped);
        }
        self.inner.metrics.record_admitted(incoming);

        let open_with_room = state
            .current
            .as_mut()
            .filter(|batch| batch.len() < max && batch.len() + incoming <= max);
        let (rx, opened) = if let Some(batch) = open_with_room {
            (batch.admit(queries), false)
        } else {
            if state.current.is_some() {
                self.detach(state, FlushTrigger::Overflow);
            }
            (self.open(state, queries, path), true)
        };

        let full = state
            .current
            .as_ref()
            .is_some_and(|batch| batch.len() >= max);
        if full {
            self.detach(state, FlushTrigger::Size);
        } else if opened {
            if let Some(batch) = state.current.as_mut() {
                let expiry = self.spawn_expiry(batch.id());
                batch.arm_expiry(expiry.abort_handle());
            }
        }

        Ok(rx)
    }

    /// Reject further submissions and release every waiting subscriber of the
    /// open batch without a value. Batches already forwarding run to completion.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Running {
            return;
        }
        state.lifecycle = Lifecycle::Stopping;

        if let Some(batch) = state.current.take() {
            let batch_id = batch.id();
            let released = batch.close();
            info!(batch_id, released, "released pending subscribers");
        }

        if state.in_flight == 0 {
            state.lifecycle = Lifecycle::Stopped;
            self.inner.drained.notify_waiters();
        }
        info!(in_flight = state.in_flight, "batcher stopping");
    }

    /// Run the lifecycle supervisor: stop the engine once `shutdown` fires.
    pub fn spawn_supervisor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("shutdown signal received by batcher");
            engine.stop();
        })
    }

    /// Wait until every forwarded batch has finished after [`stop`](Self::stop).
    /// Returns `false` if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.drained.notified();
            if self.lifecycle() == Lifecycle::Stopped {
                return true;
            }
            tokio::select! {
                _ = notified => continue,
                _ = time::sleep_until(deadline) => {
                    return self.lifecycle() == Lifecycle::Stopped;
                }
            }
        }
    }

    fn open(
        &self,
        state: &mut EngineState,
        queries: Vec<Query>,
        path: &str,
    ) -> oneshot::Receiver<BatchResponse> {
        let id = state.next_id;
        state.next_id += 1;
        let mut batch = Batch::open(id, path);
        let rx = batch.admit(queries);
        trace!(batch_id = id, path, "opened batch");
        state.current = Some(batch);
        rx
    }

    fn spawn_expiry(&self, batch_id: u64) -> JoinHandle<()> {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let delay = self.inner.config.max_latency;
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(inner) = engine.upgrade() {
                BatchEngine { inner }.expire(batch_id);
            }
        })
    }

    /// Latency trigger. A size flush may have detached this batch already, in
    /// which case the current batch (if any) has a different id and is left alone.
    fn expire(&self, batch_id: u64) {
        let mut state = self.inner.state.lock();
        let current = state.current.as_ref().map(Batch::id);
        if current != Some(batch_id) {
            trace!(batch_id, ?current, "stale expiry ignored");
            return;
        }
        if let Some(batch) = state.current.as_mut() {
            batch.clear_expiry();
        }
        self.detach(&mut state, FlushTrigger::Latency);
    }

    /// Take the open batch out of the shared state and hand it to the forwarder.
    fn detach(&self, state: &mut EngineState, trigger: FlushTrigger) {
        let Some(mut batch) = state.current.take() else {
            return;
        };
        batch.disarm();

        debug!(
            batch_id = batch.id(),
            queries = batch.len(),
            subscribers = batch.subscribers().len(),
            trigger = trigger.as_str(),
            "flushing batch"
        );
        self.inner.metrics.record_batch(trigger.as_str(), batch.len());

        state.in_flight += 1;
        let engine = self.clone();
        tokio::spawn(async move {
            engine.inner.forwarder.forward(batch).await;
            engine.finish_forward();
        });
    }

    fn finish_forward(&self) {
        let mut state = self.inner.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.lifecycle == Lifecycle::Stopping && state.in_flight == 0 {
            state.lifecycle = Lifecycle::Stopped;
            self.inner.drained.notify_waiters();
            info!("batcher drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendReply;
    use crate::testing::ScriptedBackend;
    use axum::http::StatusCode;
    use bytes::Bytes;
    use serde_json::{json, Value};

    fn engine_with(
        backend: Arc<ScriptedBackend>,
        max_batch_size: usize,
        max_latency_ms: u64,
    ) -> BatchEngine {
        let config = BatchConfig {
            max_batch_size,
            max_latency: Duration::from_millis(max_latency_ms),
            idle_timeout: Duration::from_secs(30),
        };
        let metrics = Arc::new(BatcherMetrics::new().expect("metrics"));
        BatchEngine::new(config, backend, metrics).expect("engine")
    }

    #[test]
    fn invalid_limits_fail_construction() {
        let metrics = Arc::new(BatcherMetrics::new().expect("metrics"));
        let config = BatchConfig {
            max_batch_size: 0,
            ..BatchConfig::default()
        };
        let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend::echo());
        assert!(BatchEngine::new(config, backend, metrics).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn size_bound_flushes_immediately_and_latency_bound_flushes_the_rest() {
        let backend = Arc::new(ScriptedBackend::echo());
        let engine = engine_with(backend.clone(), 2, 1_000);
        let started = Instant::now();

        let first = engine.submit(vec![json!("a")], "/predict").expect("admit a");
        let second = engine.submit(vec![json!("b")], "/predict").expect("admit b");
        assert_eq!(engine.open_batch_len(), None, "full batch must be detached");
        let third = engine.submit(vec![json!("c")], "/predict").expect("admit c");
        assert_eq!(engine.open_batch_len(), Some(1));

        let first = first.await.expect("a delivered");
        let second = second.await.expect("b delivered");
        assert_eq!(first.predictions, Some(vec![json!({"echo": "a"})]));
        assert_eq!(second.predictions, Some(vec![json!({"echo": "b"})]));
        assert!(started.elapsed() < Duration::from_millis(1_000));

        let third = third.await.expect("c delivered");
        assert_eq!(third.predictions, Some(vec![json!({"echo": "c"})]));

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].queries, vec![json!("a"), json!("b")]);
        assert_eq!(calls[1].queries, vec![json!("c")]);
        assert!(calls[0].at.duration_since(started) < Duration::from_millis(1_000));
        assert!(calls[1].at.duration_since(started) >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn variadic_submissions_share_one_batch_in_arrival_order() {
        let backend = Arc::new(ScriptedBackend::echo());
        let engine = engine_with(backend.clone(), 10, 50);

        let two = engine
            .submit(vec![json!(1), json!(2)], "/predict")
            .expect("admit");
        let none = engine.submit(Vec::new(), "/other/predict").expect("admit");
        let three = engine
            .submit(vec![json!(3), json!(4), json!(5)], "/other/predict")
            .expect("admit");

        assert_eq!(
            two.await.expect("delivered").predictions,
            Some(vec![json!({"echo": 1}), json!({"echo": 2})])
        );
        assert_eq!(none.await.expect("delivered").predictions, Some(Vec::new()));
        assert_eq!(
            three.await.expect("delivered").predictions,
            Some(vec![json!({"echo": 3}), json!({"echo": 4}), json!({"echo": 5})])
        );

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, "/predict", "path comes from the opening request");
        assert_eq!(calls[0].queries.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn submission_that_would_overflow_starts_a_new_batch() {
        let backend = Arc::new(ScriptedBackend::echo());
        let engine = engine_with(backend.clone(), 4, 1_000);
        let started = Instant::now();

        let first = engine
            .submit(vec![json!(1), json!(2), json!(3)], "/predict")
            .expect("admit");
        let second = engine
            .submit(vec![json!(4), json!(5)], "/predict")
            .expect("admit");
        assert_eq!(engine.open_batch_len(), Some(2));

        first.await.expect("delivered");
        second.await.expect("delivered");

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].queries.len(), 3);
        assert!(calls[0].at.duration_since(started) < Duration::from_millis(1_000));
        assert_eq!(calls[1].queries.len(), 2);
        assert!(calls.iter().all(|call| call.queries.len() <= 4));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_submission_is_forwarded_alone_without_waiting() {
        let backend = Arc::new(ScriptedBackend::echo());
        let engine = engine_with(backend.clone(), 2, 1_000);
        let started = Instant::now();

        let small = engine.submit(vec![json!("s")], "/predict").expect("admit");
        let big = engine
            .submit(vec![json!(1), json!(2), json!(3)], "/predict")
            .expect("admit");
        assert_eq!(engine.open_batch_len(), None);

        assert_eq!(big.await.expect("delivered").predictions.map(|p| p.len()), Some(3));
        small.await.expect("delivered");
        assert!(started.elapsed() < Duration::from_millis(1_000));

        let sizes: Vec<usize> = backend.calls().iter().map(|c| c.queries.len()).collect();
        assert_eq!(sizes, vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn size_flush_cancels_the_detached_batch_deadline() {
        let backend = Arc::new(ScriptedBackend::echo());
        let engine = engine_with(backend.clone(), 2, 100);

        let a = engine.submit(vec![json!(1)], "/predict").expect("admit");
        let b = engine.submit(vec![json!(2)], "/predict").expect("admit");
        a.await.expect("delivered");
        b.await.expect("delivered");

        time::sleep(Duration::from_millis(50)).await;
        let c = engine.submit(vec![json!(3)], "/predict").expect("admit");
        // The first batch's deadline passes here; the second batch must stay open.
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.open_batch_len(), Some(1));

        c.await.expect("delivered");
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_leaves_the_newer_batch_open() {
        let backend = Arc::new(ScriptedBackend::echo());
        let engine = engine_with(backend.clone(), 2, 1_000);

        let a = engine.submit(vec![json!(1)], "/predict").expect("admit");
        let b = engine.submit(vec![json!(2)], "/predict").expect("admit");
        let c = engine.submit(vec![json!(3)], "/predict").expect("admit");

        // Batch 1 was size-flushed; a late expiry for it must not touch batch 2.
        engine.expire(1);
        assert_eq!(engine.open_batch_len(), Some(1));

        engine.expire(2);
        assert_eq!(engine.open_batch_len(), None);

        for rx in [a, b, c] {
            assert!(rx.await.expect("delivered").is_success());
        }
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submitters_each_get_their_own_slice_exactly_once() {
        const SUBMITTERS: usize = 200;
        const MAX_BATCH: usize = 8;
        const OVERSIZED: usize = 11;

        let backend = Arc::new(ScriptedBackend::echo().delayed(Duration::from_millis(2)));
        let engine = engine_with(backend.clone(), MAX_BATCH, 3);

        // Lengths cycle through 0..=MAX_BATCH with an occasional oversized submission.
        let lengths: Vec<usize> = (0..SUBMITTERS)
            .map(|idx| {
                if idx % 37 == 5 {
                    OVERSIZED
                } else {
                    (idx * 7 + idx / 3) % (MAX_BATCH + 1)
                }
            })
            .collect();

        let mut tasks = Vec::with_capacity(SUBMITTERS);
        for (submitter, &len) in lengths.iter().enumerate() {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                if submitter % 4 == 0 {
                    time::sleep(Duration::from_millis((submitter % 5) as u64)).await;
                }
                let queries: Vec<Query> = (0..len).map(|q| json!([submitter, q])).collect();
                let rx = engine.submit(queries.clone(), "/predict").expect("admit");
                let response = time::timeout(Duration::from_secs(10), rx)
                    .await
                    .expect("delivered in time")
                    .expect("delivered with a value");
                (queries, response)
            }));
        }

        for task in tasks {
            let (queries, response) = task.await.expect("submitter finished");
            let expected: Vec<Value> = queries.iter().map(|q| json!({ "echo": q })).collect();
            assert_eq!(response.predictions, Some(expected));
        }

        let calls = backend.calls();
        let forwarded: usize = calls.iter().map(|call| call.queries.len()).sum();
        assert_eq!(forwarded, lengths.iter().sum::<usize>());
        for call in &calls {
            if call.queries.len() > MAX_BATCH {
                assert_eq!(call.queries.len(), OVERSIZED);
                let owner = &call.queries[0][0];
                assert!(
                    call.queries.iter().all(|q| &q[0] == owner),
                    "an oversized batch holds a single submission"
                );
            }
        }

        // Every query was forwarded exactly once.
        let mut seen: Vec<String> = calls
            .iter()
            .flat_map(|call| call.queries.iter().map(|q| q.to_string()))
            .collect();
        seen.sort();
        let total = seen.len();
        seen.dedup();
        assert_eq!(seen.len(), total);
        assert_eq!(engine.lifecycle(), Lifecycle::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_reaches_every_subscriber_and_engine_keeps_running() {
        let backend = Arc::new(ScriptedBackend::with(|_| BackendReply {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: Bytes::from_static(b"boom"),
        }));
        let engine = engine_with(backend.clone(), 2, 1_000);

        let a = engine.submit(vec![json!(1)], "/predict").expect("admit");
        let b = engine.submit(vec![json!(2)], "/predict").expect("admit");
        let a = a.await.expect("delivered");
        let b = b.await.expect("delivered");
        assert_eq!(a, b);
        assert!(a.predictions.is_none());
        assert!(!a.message.is_empty());

        assert_eq!(engine.lifecycle(), Lifecycle::Running);
        assert!(engine.submit(vec![json!(3)], "/predict").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_open_batch_and_rejects_new_submissions() {
        let backend = Arc::new(ScriptedBackend::echo());
        let engine = engine_with(backend.clone(), 8, 1_000);

        let a = engine.submit(vec![json!(1)], "/predict").expect("admit");
        let b = engine.submit(vec![json!(2)], "/predict").expect("admit");

        engine.stop();

        assert!(a.await.is_err(), "released without a value");
        assert!(b.await.is_err(), "released without a value");
        assert_eq!(engine.lifecycle(), Lifecycle::Stopped);
        assert_eq!(
            engine.submit(vec![json!(3)], "/predict").err(),
            Some(SubmitError::Stopped)
        );

        // The cancelled timer must not forward anything later.
        time::sleep(Duration::from_millis(2_000)).await;
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_stops_engine_on_cancellation() {
        let backend = Arc::new(ScriptedBackend::echo());
        let engine = engine_with(backend, 8, 1_000);
        let shutdown = CancellationToken::new();
        let supervisor = engine.spawn_supervisor(shutdown.clone());

        let pending = engine.submit(vec![json!(1)], "/predict").expect("admit");
        shutdown.cancel();
        supervisor.await.expect("supervisor finished");

        assert!(pending.await.is_err());
        assert_eq!(engine.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_in_flight_forward() {
        let backend = Arc::new(ScriptedBackend::echo().delayed(Duration::from_millis(500)));
        let engine = engine_with(backend.clone(), 1, 1_000);

        let forwarded = engine.submit(vec![json!(1)], "/predict").expect("admit");
        tokio::task::yield_now().await;
        engine.stop();
        assert_eq!(engine.lifecycle(), Lifecycle::Stopping);

        assert!(engine.drain(Duration::from_secs(5)).await);
        assert_eq!(engine.lifecycle(), Lifecycle::Stopped);
        assert!(forwarded.await.expect("in-flight batch still delivers").is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_timeout() {
        let backend = Arc::new(ScriptedBackend::echo().delayed(Duration::from_secs(60)));
        let engine = engine_with(backend, 1, 1_000);

        let _forwarded = engine.submit(vec![json!(1)], "/predict").expect("admit");
        tokio::task::yield_now().await;
        engine.stop();

        assert!(!engine.drain(Duration::from_millis(100)).await);
        assert_eq!(engine.lifecycle(), Lifecycle::Stopping);
    }
}
