//! Dedicated writer task for the worker's control connection.
//!
//! Handlers never touch the socket. They queue frames on a bounded channel
//! drained by a single writer task, which batches whatever is ready into one
//! flush.
//!
//! # Architecture
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<Frame> ─► Writer Task ─► WebSocket
//! Read loop ─┘
//! ```
//!
//! A full queue applies backpressure to the sending handler, which gives up
//! with [`RelaywireError::BackpressureTimeout`] after the configured timeout.

use std::time::Duration;

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{RelaywireError, Result};
use crate::protocol::{Frame, FrameCodec};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for queue space.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across handlers.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Frame>,
    timeout: Duration,
}

impl WriterHandle {
    /// Create a handle and the receiving end of its queue.
    pub(crate) fn channel(config: &WriterConfig) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let handle = Self {
            tx,
            timeout: config.backpressure_timeout,
        };
        (handle, rx)
    }

    /// Queue a frame, waiting up to the backpressure timeout for space.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send_timeout(frame, self.timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => RelaywireError::BackpressureTimeout,
                SendTimeoutError::Closed(_) => RelaywireError::ConnectionClosed,
            })
    }
}

/// Spawn the writer task over a WebSocket sink.
///
/// The task ends, closing the sink, once every [`WriterHandle`] is dropped.
pub fn spawn_writer_task<S>(sink: S, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    let (handle, rx) = WriterHandle::channel(&config);
    let task = tokio::spawn(writer_loop(rx, sink));
    (handle, task)
}

async fn writer_loop<S>(mut rx: mpsc::Receiver<Frame>, mut sink: S) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            None => {
                if let Err(e) = sink.close().await {
                    tracing::debug!("Closing control socket failed: {}", e);
                }
                return Ok(());
            }
        };

        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        for frame in batch.drain(..) {
            let text = FrameCodec::encode(&frame)?;
            sink.feed(Message::text(text)).await.map_err(socket_closed)?;
        }
        sink.flush().await.map_err(socket_closed)?;
    }
}

fn socket_closed<E: std::fmt::Display>(e: E) -> RelaywireError {
    tracing::debug!("Control socket write failed: {}", e);
    RelaywireError::ConnectionClosed
}
