//! Relay dispatch loop.
//!
//! A single task owns the worker registry, the pending-job table and the
//! stream table. HTTP handlers and control connections never touch those
//! tables; they post [`HubEvent`]s through a cheaply cloneable [`HubHandle`]
//! and the loop applies them one at a time.
//!
//! # Architecture
//!
//! ```text
//! HTTP handler ──┐                         ┌─► WorkerRegistry
//! Connection 1 ──┼─► mpsc<HubEvent> ─► Hub ┼─► Correlator
//! Connection N ──┘        ▲                └─► StreamRelay
//!                         └── job deadline timers
//! ```
//!
//! Nothing inside the loop awaits I/O. Frames for workers go into unbounded
//! per-connection queues drained by the connection tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::JobError;
use crate::protocol::{ApiRequest, Frame, JobId, Registration};

use super::correlator::{Correlator, JobHead, JobSink, UnaryResponse, DEFAULT_JOB_TIMEOUT};
use super::registry::{ConnectionId, FrameSender, SelectionPolicy, Worker, WorkerRegistry};
use super::stream::{ChunkOutcome, StreamRelay};

/// Settings for the dispatch loop.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Deadline for a job to be answered or to start streaming.
    pub job_timeout: Duration,
    /// Fail pending jobs as soon as their worker's connection closes, instead
    /// of letting them run into their deadline.
    pub fail_pending_on_disconnect: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            job_timeout: DEFAULT_JOB_TIMEOUT,
            fail_pending_on_disconnect: false,
        }
    }
}

/// Snapshot of the hub tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Registered worker ids.
    pub workers: Vec<String>,
    /// Jobs waiting for a first answer.
    pub pending: usize,
    /// Jobs currently streaming.
    pub streaming: usize,
}

/// Input to the dispatch loop.
#[derive(Debug)]
pub enum HubEvent {
    /// An HTTP request to relay.
    Submit {
        /// The request.
        request: ApiRequest,
        /// Where the outcome goes.
        sink: JobSink,
    },
    /// A connection sent `backend_register`.
    Register {
        /// Connection id.
        connection: ConnectionId,
        /// Registration details.
        registration: Registration,
        /// Frame queue of the connection, on its first registration.
        outbound: Option<FrameSender>,
    },
    /// A job-related frame arrived on a connection.
    Frame {
        /// Connection id.
        connection: ConnectionId,
        /// The frame.
        frame: Frame,
    },
    /// A connection closed.
    Closed {
        /// Connection id.
        connection: ConnectionId,
    },
    /// Request a snapshot of the tables.
    Stats {
        /// Reply channel.
        reply: oneshot::Sender<HubStats>,
    },
}

/// Handle for posting events to the dispatch loop.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubEvent>,
    next_connection: Arc<AtomicU64>,
}

impl HubHandle {
    /// Relay a request and wait for its first outcome.
    ///
    /// The wait is a deferred completion; the loop keeps serving other jobs.
    pub async fn submit(&self, request: ApiRequest) -> JobHead {
        let (sink, outcome) = oneshot::channel();
        if self.tx.send(HubEvent::Submit { request, sink }).is_err() {
            return JobHead::Failed(JobError::Shutdown);
        }
        outcome.await.unwrap_or(JobHead::Failed(JobError::Shutdown))
    }

    /// Allocate an id for a newly accepted control connection.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    /// Report a registration frame.
    pub fn register(
        &self,
        connection: ConnectionId,
        registration: Registration,
        outbound: Option<FrameSender>,
    ) {
        self.post(HubEvent::Register {
            connection,
            registration,
            outbound,
        });
    }

    /// Report a job-related frame.
    pub fn frame(&self, connection: ConnectionId, frame: Frame) {
        self.post(HubEvent::Frame { connection, frame });
    }

    /// Report a closed connection.
    pub fn closed(&self, connection: ConnectionId) {
        self.post(HubEvent::Closed { connection });
    }

    /// Get a snapshot of the hub tables.
    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        self.post(HubEvent::Stats { reply });
        rx.await.unwrap_or_default()
    }

    fn post(&self, event: HubEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Dispatch loop is gone, dropping event");
        }
    }
}

/// Spawn the dispatch loop with the default selection policy.
pub fn spawn_hub(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
    spawn_hub_with_registry(config, WorkerRegistry::new())
}

/// Spawn the dispatch loop with a custom worker selection policy.
pub fn spawn_hub_with_policy(
    config: HubConfig,
    policy: impl SelectionPolicy,
) -> (HubHandle, JoinHandle<()>) {
    spawn_hub_with_registry(config, WorkerRegistry::with_policy(policy))
}

fn spawn_hub_with_registry(
    config: HubConfig,
    registry: WorkerRegistry,
) -> (HubHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();

    let hub = Hub {
        registry,
        correlator: Correlator::new(config.job_timeout, timeouts_tx),
        streams: StreamRelay::new(),
        config,
    };
    let task = tokio::spawn(hub.run(rx, timeouts_rx));

    let handle = HubHandle {
        tx,
        next_connection: Arc::new(AtomicU64::new(1)),
    };
    (handle, task)
}

struct Hub {
    registry: WorkerRegistry,
    correlator: Correlator,
    streams: StreamRelay,
    config: HubConfig,
}

impl Hub {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<HubEvent>,
        mut timeouts: mpsc::UnboundedReceiver<JobId>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                Some(id) = timeouts.recv() => self.on_timeout(&id),
            }
        }
        tracing::debug!("Dispatch loop stopped");
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Submit { request, sink } => self.submit(request, sink),
            HubEvent::Register {
                connection,
                registration,
                outbound,
            } => self.register(connection, registration, outbound),
            HubEvent::Frame { connection, frame } => self.dispatch_frame(connection, frame),
            HubEvent::Closed { connection } => self.connection_closed(connection),
            HubEvent::Stats { reply } => {
                let _ = reply.send(HubStats {
                    workers: self.registry.ids(),
                    pending: self.correlator.len(),
                    streaming: self.streams.len(),
                });
            }
        }
    }

    fn submit(&mut self, request: ApiRequest, sink: JobSink) {
        for id in self.correlator.drop_abandoned() {
            tracing::debug!(job = %id, "Client left before the job was answered");
        }

        let Some(worker) = self.registry.select_worker() else {
            tracing::warn!(method = %request.method, path = %request.path, "No backend servers available");
            let _ = sink.send(JobHead::Failed(JobError::NoWorkerAvailable));
            return;
        };

        let id = self
            .correlator
            .submit(&request, &worker.id, worker.connection, sink);
        tracing::info!(
            job = %id,
            worker = %worker.id,
            method = %request.method,
            path = %request.path,
            "Relaying request"
        );

        let connection = worker.connection;
        let frame = Frame::ApiRequest {
            request_id: id.clone(),
            data: request,
        };
        if !worker.send(frame) {
            tracing::warn!(job = %id, "Worker connection closed before the request was sent");
            self.correlator
                .resolve(&id, connection, Err(JobError::WorkerDisconnected));
        }
    }

    fn register(
        &mut self,
        connection: ConnectionId,
        registration: Registration,
        outbound: Option<FrameSender>,
    ) {
        let outbound = match outbound {
            Some(outbound) => outbound,
            None => match self.registry.by_connection(connection) {
                Some(existing) => existing.outbound.clone(),
                None => {
                    tracing::warn!(%connection, "Registration on a connection that was displaced");
                    return;
                }
            },
        };

        let worker = Worker::new(registration, connection, outbound);
        tracing::info!(
            worker = %worker.id,
            %connection,
            version = %worker.version,
            capabilities = ?worker.capabilities,
            "Backend registered"
        );

        for displaced in self.registry.register(worker) {
            if displaced.connection != connection {
                tracing::info!(
                    worker = %displaced.id,
                    connection = %displaced.connection,
                    "Closing connection replaced by a newer registration"
                );
            }
        }
    }

    fn dispatch_frame(&mut self, connection: ConnectionId, frame: Frame) {
        match frame {
            Frame::ApiResponse { request_id, data } => {
                let outcome = UnaryResponse::from_payload(data);
                if let Some(resolved) = self
                    .correlator
                    .resolve(&request_id, connection, outcome.clone())
                {
                    tracing::info!(
                        job = %resolved.id,
                        worker = %resolved.worker,
                        duration_ms = resolved.elapsed.as_millis() as u64,
                        delivered = resolved.delivered,
                        "Response relayed"
                    );
                } else if self.streams.contains(&request_id) {
                    // A worker that fails mid-stream reports it with an api_response.
                    let error = outcome.err().unwrap_or(JobError::WorkerReported {
                        status: 500,
                        message: "Unexpected response on an open stream".to_string(),
                    });
                    if let Some(summary) = self.streams.abort(&request_id, connection, error) {
                        tracing::warn!(job = %summary.id, chunks = summary.chunks, "Stream aborted by worker error");
                    }
                } else {
                    tracing::debug!(job = %request_id, "Discarding response for unknown job");
                }
            }
            Frame::StreamingStart { request_id, data } => {
                let Some(job) = self.correlator.begin_stream(&request_id, connection) else {
                    tracing::debug!(job = %request_id, "Discarding streaming_start for unknown job");
                    return;
                };
                let content_type = data.and_then(|d| d.content_type);
                if self.streams.open(job, content_type) {
                    tracing::debug!(job = %request_id, "Stream opened");
                } else {
                    tracing::info!(job = %request_id, "Client left before the stream started");
                }
            }
            Frame::StreamingChunk {
                request_id,
                data,
                sequence,
            } => match self.streams.chunk(&request_id, connection, data, sequence) {
                ChunkOutcome::Forwarded => {}
                ChunkOutcome::ClientGone => {
                    tracing::info!(job = %request_id, "Client disconnected mid-stream, dropping remaining chunks");
                }
                ChunkOutcome::Unknown => {
                    tracing::debug!(job = %request_id, "Discarding chunk for unknown stream");
                }
            },
            Frame::StreamingEnd { request_id } => match self.streams.end(&request_id, connection) {
                Some(summary) => tracing::info!(
                    job = %summary.id,
                    worker = %summary.worker,
                    chunks = summary.chunks,
                    bytes = summary.bytes,
                    duration_ms = summary.elapsed.as_millis() as u64,
                    "Stream relayed"
                ),
                None => tracing::debug!(job = %request_id, "Discarding streaming_end for unknown stream"),
            },
            other => {
                tracing::debug!(%connection, kind = other.kind(), "Ignoring frame in dispatch loop");
            }
        }
    }

    fn connection_closed(&mut self, connection: ConnectionId) {
        if let Some(worker) = self.registry.deregister_connection(connection) {
            tracing::info!(worker = %worker.id, %connection, "Backend disconnected");
        }

        let aborted = self
            .streams
            .abort_connection(connection, JobError::WorkerDisconnected);
        for summary in &aborted {
            tracing::warn!(
                job = %summary.id,
                chunks = summary.chunks,
                "Force-closed stream after worker disconnect"
            );
        }

        if self.config.fail_pending_on_disconnect {
            let failed = self
                .correlator
                .fail_connection(connection, JobError::WorkerDisconnected);
            if failed > 0 {
                tracing::warn!(%connection, failed, "Failed pending jobs of disconnected worker");
            }
        } else {
            let orphaned = self.correlator.pending_for(connection);
            if orphaned > 0 {
                tracing::warn!(%connection, orphaned, "Pending jobs left to run into their deadline");
            }
        }
    }

    fn on_timeout(&mut self, id: &JobId) {
        if let Some(resolved) = self.correlator.on_timeout(id) {
            tracing::warn!(
                job = %resolved.id,
                worker = %resolved.worker,
                duration_ms = resolved.elapsed.as_millis() as u64,
                "Job deadline exceeded"
            );
        }
    }
}
