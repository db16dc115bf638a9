//! Request correlator.
//!
//! Owns the pending-job table: one entry per relayed request that has been
//! forwarded to a worker and has not yet been answered, streamed, or timed
//! out. Every entry holds a one-shot completion sink; taking the entry out of
//! the table is the only way to reach the sink, so each job is delivered at
//! most once and the first of {response, stream start, timeout} wins.
//!
//! Deadlines are scheduled as small tasks that post the job id back on the
//! timeout channel. The timer is aborted when the job leaves the table by any
//! other route, and an expiry for an id no longer present is ignored.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::JobError;
use crate::protocol::{ApiRequest, JobId, ResponsePayload};

use super::registry::ConnectionId;

/// Default job deadline.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

/// Default status for worker errors that do not state one.
const DEFAULT_ERROR_STATUS: u16 = 500;

/// Item of a streamed body. An `Err` terminates the HTTP response abnormally.
pub type StreamItem = std::result::Result<Bytes, JobError>;

/// Body of a unary response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// JSON document.
    Json(Value),
    /// Plain text.
    Text(String),
}

/// A complete unary answer.
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryResponse {
    /// HTTP status.
    pub status: u16,
    /// Response body.
    pub body: ResponseBody,
}

impl UnaryResponse {
    /// Interpret a worker's `api_response` payload.
    pub fn from_payload(payload: ResponsePayload) -> Result<Self, JobError> {
        if let Some(message) = payload.error {
            return Err(JobError::WorkerReported {
                status: payload.status.unwrap_or(DEFAULT_ERROR_STATUS),
                message,
            });
        }

        let status = payload.status.unwrap_or(200);
        let body = match payload.text {
            Some(text) => ResponseBody::Text(text),
            None => ResponseBody::Json(payload.data.unwrap_or(Value::Null)),
        };
        Ok(Self { status, body })
    }
}

/// Streamed answer handed to the gateway.
#[derive(Debug)]
pub struct StreamBody {
    /// Content type of the streamed body.
    pub content_type: String,
    /// Chunks in arrival order. Closes cleanly on `streaming_end`.
    pub chunks: mpsc::UnboundedReceiver<StreamItem>,
}

/// First (and only) thing delivered to a job's completion sink.
#[derive(Debug)]
pub enum JobHead {
    /// The worker answered with a single response.
    Unary(UnaryResponse),
    /// The worker started a stream.
    Stream(StreamBody),
    /// The job failed.
    Failed(JobError),
}

/// Completion handle for one job.
pub type JobSink = oneshot::Sender<JobHead>;

/// A job waiting for its worker.
#[derive(Debug)]
pub struct PendingJob {
    /// Job id.
    pub id: JobId,
    /// HTTP method of the relayed request.
    pub method: String,
    /// Path of the relayed request.
    pub path: String,
    /// Backend id of the assigned worker.
    pub worker: String,
    /// Connection the request was sent on.
    pub connection: ConnectionId,
    /// Submission time.
    pub submitted_at: Instant,
    sink: JobSink,
    timer: Option<AbortHandle>,
}

impl PendingJob {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Deliver the job's outcome. Returns false if the HTTP client is gone.
    pub fn deliver(mut self, head: JobHead) -> bool {
        self.cancel_timer();
        self.sink.send(head).is_ok()
    }

    /// Check if the HTTP client stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.sink.is_closed()
    }
}

/// The pending-job table.
pub struct Correlator {
    jobs: HashMap<JobId, PendingJob>,
    by_connection: HashMap<ConnectionId, HashSet<JobId>>,
    next_sequence: u64,
    timeout: Duration,
    timeouts: mpsc::UnboundedSender<JobId>,
}

impl Correlator {
    /// Create a correlator whose deadlines post expired ids on `timeouts`.
    pub fn new(timeout: Duration, timeouts: mpsc::UnboundedSender<JobId>) -> Self {
        Self {
            jobs: HashMap::new(),
            by_connection: HashMap::new(),
            next_sequence: 1,
            timeout,
            timeouts,
        }
    }

    /// Record a new pending job and arm its deadline.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(
        &mut self,
        request: &ApiRequest,
        worker: &str,
        connection: ConnectionId,
        sink: JobSink,
    ) -> JobId {
        let id = JobId::from_sequence(self.next_sequence);
        self.next_sequence += 1;

        let timer = {
            let id = id.clone();
            let timeouts = self.timeouts.clone();
            let after = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = timeouts.send(id);
            })
            .abort_handle()
        };

        self.jobs.insert(
            id.clone(),
            PendingJob {
                id: id.clone(),
                method: request.method.clone(),
                path: request.path.clone(),
                worker: worker.to_string(),
                connection,
                submitted_at: Instant::now(),
                sink,
                timer: Some(timer),
            },
        );
        self.by_connection
            .entry(connection)
            .or_default()
            .insert(id.clone());
        id
    }

    /// Resolve a pending job with the worker's unary answer.
    ///
    /// Returns the resolved job's metadata, or `None` if the id is unknown,
    /// already resolved, or owned by a different connection.
    pub fn resolve(
        &mut self,
        id: &JobId,
        from: ConnectionId,
        outcome: Result<UnaryResponse, JobError>,
    ) -> Option<Resolved> {
        let job = self.take_owned(id, from)?;
        let head = match outcome {
            Ok(response) => JobHead::Unary(response),
            Err(err) => JobHead::Failed(err),
        };
        Some(Resolved::from_delivery(job, head))
    }

    /// Fail a job whose deadline elapsed. No-op if it already left the table.
    pub fn on_timeout(&mut self, id: &JobId) -> Option<Resolved> {
        let job = self.remove(id)?;
        Some(Resolved::from_delivery(job, JobHead::Failed(JobError::Timeout)))
    }

    /// Hand a pending job over to the stream relay, disarming its deadline.
    pub fn begin_stream(&mut self, id: &JobId, from: ConnectionId) -> Option<PendingJob> {
        let mut job = self.take_owned(id, from)?;
        job.cancel_timer();
        Some(job)
    }

    /// Fail every job assigned to a connection. Returns how many were failed.
    pub fn fail_connection(&mut self, connection: ConnectionId, error: JobError) -> usize {
        let ids = self.by_connection.remove(&connection).unwrap_or_default();
        let mut failed = 0;
        for id in ids {
            if let Some(job) = self.jobs.remove(&id) {
                job.deliver(JobHead::Failed(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Drop jobs whose HTTP client stopped waiting. Returns the dropped ids.
    pub fn drop_abandoned(&mut self) -> Vec<JobId> {
        let abandoned: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.is_abandoned())
            .map(|job| job.id.clone())
            .collect();
        for id in &abandoned {
            if let Some(mut job) = self.remove(id) {
                job.cancel_timer();
            }
        }
        abandoned
    }

    /// Number of pending jobs assigned to a connection.
    pub fn pending_for(&self, connection: ConnectionId) -> usize {
        self.by_connection.get(&connection).map_or(0, HashSet::len)
    }

    /// Check if a job is pending.
    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    /// Number of pending jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Check if no job is pending.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn take_owned(&mut self, id: &JobId, from: ConnectionId) -> Option<PendingJob> {
        let owner = self.jobs.get(id)?.connection;
        if owner != from {
            tracing::warn!(
                job = %id,
                owner = %owner,
                from = %from,
                "Ignoring frame for job owned by another connection"
            );
            return None;
        }
        self.remove(id)
    }

    fn remove(&mut self, id: &JobId) -> Option<PendingJob> {
        let job = self.jobs.remove(id)?;
        if let Some(ids) = self.by_connection.get_mut(&job.connection) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_connection.remove(&job.connection);
            }
        }
        Some(job)
    }
}

/// Summary of a job that left the table with a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Job id.
    pub id: JobId,
    /// Assigned worker.
    pub worker: String,
    /// Time since submission.
    pub elapsed: Duration,
    /// False if the HTTP client had already gone away.
    pub delivered: bool,
}

impl Resolved {
    fn from_delivery(job: PendingJob, head: JobHead) -> Self {
        let id = job.id.clone();
        let worker = job.worker.clone();
        let elapsed = job.submitted_at.elapsed();
        let delivered = job.deliver(head);
        Self {
            id,
            worker,
            elapsed,
            delivered,
        }
    }
}
