//! HTTP service implementation and request dispatch.
//!
//! This module contains the catch-all handler that turns each request into a
//! worker process plus a keep-alive response stream, along with the shutdown
//! coordination for in-flight streams.
//!
//! ## Structure
//!
//! - [`handler`] - Service entry point (`KeepWarmService`) and router.

pub mod handler;
