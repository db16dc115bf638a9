//! Stream relay.
//!
//! Jobs answered with `streaming_start` leave the pending-job table and live
//! here until `streaming_end`, until the worker's connection drops, or until
//! the HTTP client stops reading. Chunks are forwarded in the order they are
//! dispatched. Sequence numbers are only checked to log gaps.
//!
//! Chunk delivery uses an unbounded channel. A slow HTTP client therefore
//! makes chunks accumulate in relay memory rather than stalling the dispatch
//! loop for every other job.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::JobError;
use crate::protocol::JobId;

use super::correlator::{JobHead, PendingJob, StreamBody, StreamItem};
use super::registry::ConnectionId;

/// Content type used when `streaming_start` does not name one.
pub const DEFAULT_STREAM_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// What happened to a forwarded chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Written to the client's body channel.
    Forwarded,
    /// The client is gone; the stream was force-completed and removed.
    ClientGone,
    /// No open stream for that id (never opened, ended, or aborted).
    Unknown,
}

/// Totals for a finished stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Job id.
    pub id: JobId,
    /// Assigned worker.
    pub worker: String,
    /// Chunks forwarded.
    pub chunks: u64,
    /// Bytes forwarded.
    pub bytes: usize,
    /// Time since the job was submitted.
    pub elapsed: Duration,
}

struct StreamContext {
    worker: String,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<StreamItem>,
    submitted_at: Instant,
    chunks: u64,
    bytes: usize,
    last_sequence: Option<u64>,
}

impl StreamContext {
    fn summary(&self, id: JobId) -> StreamSummary {
        StreamSummary {
            id,
            worker: self.worker.clone(),
            chunks: self.chunks,
            bytes: self.bytes,
            elapsed: self.submitted_at.elapsed(),
        }
    }
}

/// Table of open streams.
#[derive(Default)]
pub struct StreamRelay {
    streams: HashMap<JobId, StreamContext>,
}

impl StreamRelay {
    /// Create an empty stream table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stream for a job handed over by the correlator.
    ///
    /// Switches the HTTP response to streaming mode. Returns false if the
    /// client had already gone away, in which case nothing is recorded.
    pub fn open(&mut self, job: PendingJob, content_type: Option<String>) -> bool {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = job.id.clone();
        let worker = job.worker.clone();
        let connection = job.connection;
        let submitted_at = job.submitted_at;

        let body = StreamBody {
            content_type: content_type.unwrap_or_else(|| DEFAULT_STREAM_CONTENT_TYPE.to_string()),
            chunks: rx,
        };
        if !job.deliver(JobHead::Stream(body)) {
            return false;
        }

        self.streams.insert(
            id,
            StreamContext {
                worker,
                connection,
                tx,
                submitted_at,
                chunks: 0,
                bytes: 0,
                last_sequence: None,
            },
        );
        true
    }

    /// Forward one chunk.
    pub fn chunk(
        &mut self,
        id: &JobId,
        from: ConnectionId,
        data: String,
        sequence: Option<u64>,
    ) -> ChunkOutcome {
        let Some(ctx) = self.owned_mut(id, from) else {
            return ChunkOutcome::Unknown;
        };

        if let Some(seq) = sequence {
            if let Some(last) = ctx.last_sequence {
                if seq != last + 1 {
                    tracing::warn!(job = %id, expected = last + 1, got = seq, "Stream chunk out of sequence");
                }
            }
            ctx.last_sequence = Some(seq);
        }

        let len = data.len();
        if ctx.tx.send(Ok(Bytes::from(data))).is_err() {
            self.streams.remove(id);
            return ChunkOutcome::ClientGone;
        }
        ctx.chunks += 1;
        ctx.bytes += len;
        ChunkOutcome::Forwarded
    }

    /// Close a stream cleanly.
    pub fn end(&mut self, id: &JobId, from: ConnectionId) -> Option<StreamSummary> {
        self.owned_mut(id, from)?;
        let ctx = self.streams.remove(id)?;
        Some(ctx.summary(id.clone()))
    }

    /// Force-close a stream. The HTTP body terminates with an error.
    pub fn abort(&mut self, id: &JobId, from: ConnectionId, error: JobError) -> Option<StreamSummary> {
        self.owned_mut(id, from)?;
        let ctx = self.streams.remove(id)?;
        let _ = ctx.tx.send(Err(error));
        Some(ctx.summary(id.clone()))
    }

    /// Force-close every stream fed by a connection.
    pub fn abort_connection(&mut self, connection: ConnectionId, error: JobError) -> Vec<StreamSummary> {
        let ids: Vec<JobId> = self
            .streams
            .iter()
            .filter(|(_, ctx)| ctx.connection == connection)
            .map(|(id, _)| id.clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.abort(&id, connection, error.clone()))
            .collect()
    }

    /// Check if a stream is open for a job.
    pub fn contains(&self, id: &JobId) -> bool {
        self.streams.contains_key(id)
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Check if no stream is open.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn owned_mut(&mut self, id: &JobId, from: ConnectionId) -> Option<&mut StreamContext> {
        let ctx = self.streams.get_mut(id)?;
        if ctx.connection != from {
            tracing::warn!(job = %id, from = %from, "Ignoring stream frame from another connection");
            return None;
        }
        Some(ctx)
    }
}
