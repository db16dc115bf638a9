//! Control-channel frame types.
//!
//! Every message on the control channel is one JSON object whose `type` field
//! selects the variant. Field names follow the wire schema exactly
//! (`requestId`, `backendId`, ...).
//!
//! # Example
//!
//! ```
//! use relaywire::protocol::{Frame, JobId};
//!
//! let frame = Frame::StreamingEnd { request_id: JobId::from("req_7") };
//! assert_eq!(frame.request_id().map(JobId::as_str), Some("req_7"));
//! assert_eq!(frame.kind(), "streaming_end");
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier of an in-flight job (`requestId` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Build the id for the `n`-th job of this process.
    pub fn from_sequence(n: u64) -> Self {
        Self(format!("req_{n}"))
    }

    /// Get the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registration payload sent by a worker right after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Worker identity, stable across reconnects if the worker chooses so.
    pub backend_id: String,
    /// Declared capability names.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Worker version tag.
    #[serde(default)]
    pub version: String,
}

/// An HTTP request forwarded to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// HTTP method, upper case.
    pub method: String,
    /// Request path including the query string, if any.
    pub path: String,
    /// Request headers (lower-cased names).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body; JSON when the client sent JSON, a string otherwise.
    #[serde(default)]
    pub body: Value,
}

/// Worker answer for a unary job.
///
/// Exactly one of `error`, `text` or `data` is meaningful; `error` wins when
/// several are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// HTTP status to answer with (200 for success, 500 for errors when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// JSON body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Plain text body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    /// JSON success payload.
    pub fn json(data: Value, status: u16) -> Self {
        Self {
            status: Some(status),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Plain text success payload.
    pub fn text(text: impl Into<String>, status: u16) -> Self {
        Self {
            status: Some(status),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Error payload.
    pub fn error(message: impl Into<String>, status: u16) -> Self {
        Self {
            status: Some(status),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Optional metadata carried by `streaming_start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    /// Content type of the streamed body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A control-channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// worker → relay: announce identity and capabilities.
    BackendRegister {
        /// Registration details.
        data: Registration,
    },
    /// relay → worker: execute a request.
    ApiRequest {
        /// Job id.
        #[serde(rename = "requestId")]
        request_id: JobId,
        /// The request.
        data: ApiRequest,
    },
    /// worker → relay: single response for a job.
    ApiResponse {
        /// Job id.
        #[serde(rename = "requestId")]
        request_id: JobId,
        /// Response or error.
        data: ResponsePayload,
    },
    /// worker → relay: the job answers with a stream.
    StreamingStart {
        /// Job id.
        #[serde(rename = "requestId")]
        request_id: JobId,
        /// Stream metadata.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<StreamStart>,
    },
    /// worker → relay: one chunk of a stream.
    StreamingChunk {
        /// Job id.
        #[serde(rename = "requestId")]
        request_id: JobId,
        /// Chunk text.
        #[serde(default)]
        data: String,
        /// Sender-side sequence number (informational only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },
    /// worker → relay: the stream is complete.
    StreamingEnd {
        /// Job id.
        #[serde(rename = "requestId")]
        request_id: JobId,
    },
    /// Liveness probe, either direction.
    Heartbeat {
        /// Sender clock, epoch milliseconds.
        #[serde(default)]
        timestamp: i64,
    },
    /// Answer to a heartbeat.
    HeartbeatAck {
        /// Echo of the heartbeat timestamp.
        #[serde(default)]
        timestamp: i64,
    },
    /// relay → worker: liveness probe.
    Ping {
        /// Sender clock, epoch milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    /// worker → relay: answer to a ping.
    Pong {
        /// Worker clock, epoch milliseconds.
        #[serde(default)]
        timestamp: i64,
    },
}

impl Frame {
    /// Job id carried by the frame, if any.
    pub fn request_id(&self) -> Option<&JobId> {
        match self {
            Self::ApiRequest { request_id, .. }
            | Self::ApiResponse { request_id, .. }
            | Self::StreamingStart { request_id, .. }
            | Self::StreamingChunk { request_id, .. }
            | Self::StreamingEnd { request_id } => Some(request_id),
            _ => None,
        }
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendRegister { .. } => "backend_register",
            Self::ApiRequest { .. } => "api_request",
            Self::ApiResponse { .. } => "api_response",
            Self::StreamingStart { .. } => "streaming_start",
            Self::StreamingChunk { .. } => "streaming_chunk",
            Self::StreamingEnd { .. } => "streaming_end",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Current wall clock in epoch milliseconds, as carried by heartbeats.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
