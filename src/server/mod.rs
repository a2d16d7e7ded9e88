//! HTTP server for monitoring and steering the streamer.
//!
//! - [`api`]: Routes, request/response types and handlers
//! - [`metrics`]: Prometheus gauges fed from collection stats

pub mod api;
pub mod metrics;
