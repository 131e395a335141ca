//! HTTP server wiring for the keep-alive streaming service.
//!
//! - [`config`] - Command-line / environment configuration.
//! - [`service`] - Catch-all request handler and router.
//! - [`telemetry`] - Logging, tracing and metrics setup.

pub mod config;
pub mod service;
pub mod telemetry;
