// Numan Thabit 2025
//! predict-batcher: micro-batching front door for a single inference service.
//!
//! Concurrent predict requests are accumulated into one downstream call,
//! bounded by a maximum batch size and a maximum wait, and the combined reply
//! is split back to each caller.

/// Downstream transport to the inference service.
pub mod backend;
/// In-flight batch and subscriber types.
pub mod batch;
/// CLI and file configuration.
pub mod config;
/// Admission control, flush triggers and lifecycle.
pub mod engine;
/// Combined call and per-caller fan-out.
pub mod forward;
/// HTTP front door.
pub mod handler;
/// Prometheus instrumentation.
pub mod metrics;
/// Router and listener wiring.
pub mod server;

#[cfg(test)]
mod testing;
