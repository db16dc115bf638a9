//! Error types for relaywire.
//!
//! [`RelaywireError`] covers transport and protocol failures on either side of
//! the control channel. [`JobError`] is the gateway-facing outcome of a job
//! that did not produce a worker response, and renders itself as an HTTP
//! response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Main error type for control-channel operations.
#[derive(Debug, Error)]
pub enum RelaywireError {
    /// I/O error on a socket or listener.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error on the worker side of the control channel.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Relay URL could not be parsed.
    #[error("Invalid relay URL: {0}")]
    Url(#[from] url::ParseError),

    /// Protocol error (undecodable frame, unexpected frame type, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A worker handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound frame queue stayed full for longer than the configured timeout.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// The worker gave up reconnecting after the configured number of attempts.
    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),
}

/// Result type alias using RelaywireError.
pub type Result<T> = std::result::Result<T, RelaywireError>;

/// Failure outcome of a relayed job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// No worker was registered at submission time. No job is created.
    #[error("No backend servers available")]
    NoWorkerAvailable,

    /// The job deadline elapsed before the worker answered.
    #[error("Request timeout")]
    Timeout,

    /// The worker answered with an error payload.
    #[error("{message}")]
    WorkerReported {
        /// Status stated by the worker (500 when absent).
        status: u16,
        /// Error message from the worker.
        message: String,
    },

    /// The worker's control connection closed while the job was in flight.
    #[error("Backend disconnected")]
    WorkerDisconnected,

    /// The route is not part of the relayed endpoint set.
    #[error("Not found")]
    NotFound,

    /// The dispatch loop is gone (relay shutting down).
    #[error("Relay shutting down")]
    Shutdown,
}

impl JobError {
    /// HTTP status this failure is rendered with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoWorkerAvailable | Self::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::WorkerReported { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::WorkerDisconnected => StatusCode::BAD_GATEWAY,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}
