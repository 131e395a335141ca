//! Error types for the keep-alive streaming service.
//!
//! This module defines the central `Error` enum, which captures every failure
//! a request can run into before its response starts streaming. It implements
//! [`IntoResponse`] so handlers can return it directly and have it mapped to
//! an HTTP status code.
//!
//! ## Error Cases
//! - `BodyRead`: The transport failed while the request body was drained.
//! - `BodyTooLarge`: The request body exceeded the configured limit.
//! - `Spawn`: The worker process could not be started.
//! - `SlotAlreadySet`: A second value was written into a result slot.
//! - `InvalidConfig`: Stream or server configuration failed validation.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.
//!
//! Client disconnects are not represented here: they end a stream normally and
//! are only logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the keep-alive streaming service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Reading the request body failed mid-stream.
    #[error("Failed to read request body: {context}")]
    BodyRead { context: String },

    /// The request body grew past the configured limit.
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The worker process could not be started.
    #[error("Failed to spawn worker `{program}`: {context}")]
    Spawn { program: String, context: String },

    /// A result slot can only be written once.
    #[error("Result slot already holds a value")]
    SlotAlreadySet,

    /// Configuration values were out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// HTTP status code reported to the client for this error.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BodyRead { .. } => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Spawn { .. } | Self::SlotAlreadySet | Self::InvalidConfig { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
