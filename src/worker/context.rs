//! Request context for worker handlers.
//!
//! Provides methods for answering a relayed request:
//! - `respond` / `respond_with_status` - send a single JSON response
//! - `respond_text` - send a single plain text response
//! - `error` - send an error response
//! - `start_stream`, `chunk`, `end` - stream the answer
//!
//! A context answers exactly once. After a unary response, an error, or the
//! end of a stream, every further answer fails with a protocol error.
//!
//! # Example
//!
//! ```ignore
//! async fn projects(_: (), ctx: RequestContext) -> Result<()> {
//!     ctx.respond(&serde_json::json!({ "projects": [] })).await
//! }
//!
//! async fn chat(body: ChatRequest, ctx: RequestContext) -> Result<()> {
//!     for word in body.message.split_whitespace() {
//!         ctx.chunk(word).await?;
//!     }
//!     ctx.end().await
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{RelaywireError, Result};
use crate::protocol::{Frame, JobId, ResponsePayload, StreamStart};

use super::writer::WriterHandle;

const IDLE: u8 = 0;
const STREAMING: u8 = 1;
const DONE: u8 = 2;

/// Where a context is in its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing sent yet.
    Idle,
    /// `streaming_start` sent, stream still open.
    Streaming,
    /// Answer complete.
    Done,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            IDLE => Self::Idle,
            STREAMING => Self::Streaming,
            _ => Self::Done,
        }
    }
}

struct Progress {
    phase: AtomicU8,
    sequence: AtomicU64,
}

/// Context passed to request handlers.
///
/// `RequestContext` is `Clone`; clones share the same answer state.
#[derive(Clone)]
pub struct RequestContext {
    request_id: JobId,
    params: Arc<HashMap<String, String>>,
    writer: Option<WriterHandle>,
    progress: Arc<Progress>,
}

impl RequestContext {
    /// Create a context without a writer (for testing).
    pub fn new(request_id: impl Into<JobId>) -> Self {
        Self::build(request_id.into(), None)
    }

    /// Create a context that answers through a writer.
    pub fn with_writer(request_id: JobId, writer: WriterHandle) -> Self {
        Self::build(request_id, Some(writer))
    }

    fn build(request_id: JobId, writer: Option<WriterHandle>) -> Self {
        Self {
            request_id,
            params: Arc::new(HashMap::new()),
            writer,
            progress: Arc::new(Progress {
                phase: AtomicU8::new(IDLE),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = Arc::new(params);
        self
    }

    /// Get the job id.
    #[inline]
    pub fn request_id(&self) -> &JobId {
        &self.request_id
    }

    /// Get a path parameter captured by the route pattern.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Get the answer phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.progress.phase.load(Ordering::Acquire))
    }

    /// Send a JSON response with status 200.
    pub async fn respond<T: Serialize>(&self, data: &T) -> Result<()> {
        self.respond_with_status(200, data).await
    }

    /// Send a JSON response with the given status.
    pub async fn respond_with_status<T: Serialize>(&self, status: u16, data: &T) -> Result<()> {
        let value = serde_json::to_value(data)?;
        self.complete(IDLE, ResponsePayload::json(value, status)).await
    }

    /// Send a plain text response.
    pub async fn respond_text(&self, text: impl Into<String>, status: u16) -> Result<()> {
        self.complete(IDLE, ResponsePayload::text(text, status)).await
    }

    /// Send an error response.
    ///
    /// Valid before or during a stream; an open stream is force-closed by the
    /// relay.
    pub async fn error(&self, message: impl Into<String>, status: u16) -> Result<()> {
        let payload = ResponsePayload::error(message, status);
        match self.complete(IDLE, payload.clone()).await {
            Err(RelaywireError::Protocol(_)) => self.complete(STREAMING, payload).await,
            other => other,
        }
    }

    /// Start a stream with the default content type.
    pub async fn start_stream(&self) -> Result<()> {
        self.open_stream(None).await
    }

    /// Start a stream with an explicit content type.
    pub async fn start_stream_with_type(&self, content_type: impl Into<String>) -> Result<()> {
        self.open_stream(Some(content_type.into())).await
    }

    /// Send a stream chunk, starting the stream first if needed.
    pub async fn chunk(&self, data: impl Into<String>) -> Result<()> {
        if self.phase() == Phase::Idle {
            self.start_stream().await?;
        }
        if self.phase() != Phase::Streaming {
            return Err(self.already_answered());
        }

        let sequence = self.progress.sequence.fetch_add(1, Ordering::AcqRel);
        self.send(Frame::StreamingChunk {
            request_id: self.request_id.clone(),
            data: data.into(),
            sequence: Some(sequence),
        })
        .await
    }

    /// Send a value as one line of newline-delimited JSON.
    pub async fn chunk_json<T: Serialize>(&self, data: &T) -> Result<()> {
        let mut line = serde_json::to_string(data)?;
        line.push('\n');
        self.chunk(line).await
    }

    /// End the stream, starting an empty one first if needed.
    pub async fn end(&self) -> Result<()> {
        if self.phase() == Phase::Idle {
            self.start_stream().await?;
        }
        self.transition(STREAMING, DONE)?;
        self.send(Frame::StreamingEnd {
            request_id: self.request_id.clone(),
        })
        .await
    }

    async fn open_stream(&self, content_type: Option<String>) -> Result<()> {
        self.transition(IDLE, STREAMING)?;
        self.send(Frame::StreamingStart {
            request_id: self.request_id.clone(),
            data: content_type.map(|ct| StreamStart {
                content_type: Some(ct),
            }),
        })
        .await
    }

    async fn complete(&self, from: u8, payload: ResponsePayload) -> Result<()> {
        self.transition(from, DONE)?;
        self.send(Frame::ApiResponse {
            request_id: self.request_id.clone(),
            data: payload,
        })
        .await
    }

    fn transition(&self, from: u8, to: u8) -> Result<()> {
        self.progress
            .phase
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| self.already_answered())
    }

    fn already_answered(&self) -> RelaywireError {
        RelaywireError::Protocol(format!(
            "request {} already answered ({:?})",
            self.request_id,
            self.phase()
        ))
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.send(frame).await,
            // No writer configured (testing mode)
            None => Ok(()),
        }
    }
}
