//! Control connection session.
//!
//! One task per accepted worker WebSocket. It decodes inbound frames and
//! forwards them to the dispatch loop, and drains the connection's outbound
//! frame queue onto the socket. Liveness frames (`heartbeat`, `ping`, `pong`)
//! are handled here and never reach the dispatch loop.
//!
//! The queue sender is handed to the dispatch loop with the first
//! registration. When the loop drops it (the worker was replaced by a newer
//! registration) the queue closes and the session closes the socket.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};

use crate::protocol::{now_millis, Frame, FrameCodec};

use super::hub::HubHandle;
use super::registry::ConnectionId;

/// Default interval between relay pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default silence after which a control connection is considered dead.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);

/// Liveness settings for control connections.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Interval between `ping` frames.
    pub ping_interval: Duration,
    /// Close the connection when nothing was received for this long.
    pub liveness_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

type WsSink = SplitSink<WebSocket, Message>;

/// Run a control connection until the socket closes.
pub async fn run_connection(socket: WebSocket, hub: HubHandle, config: ConnectionConfig) {
    let connection = hub.next_connection_id();
    tracing::info!(%connection, "Control connection opened");

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let mut outbound_tx = Some(outbound_tx);

    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            message = stream.next() => {
                let frame = match message {
                    Some(Ok(Message::Text(text))) => FrameCodec::decode(&text),
                    Some(Ok(Message::Binary(bytes))) => FrameCodec::decode_bytes(&bytes),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%connection, "Control socket error: {}", e);
                        break;
                    }
                };
                last_seen = Instant::now();

                match frame {
                    Ok(frame) => {
                        if let Some(reply) = on_frame(&hub, connection, &mut outbound_tx, frame) {
                            if !write_frame(&mut sink, &reply).await {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%connection, "Discarding malformed frame: {}", e);
                    }
                }
            }
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if !write_frame(&mut sink, &frame).await {
                        break;
                    }
                }
                None => {
                    tracing::info!(%connection, "Closing replaced control connection");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > config.liveness_timeout {
                    tracing::warn!(%connection, "Control connection silent past liveness timeout");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                let probe = Frame::Ping { timestamp: Some(now_millis()) };
                if !write_frame(&mut sink, &probe).await {
                    break;
                }
            }
        }
    }

    hub.closed(connection);
    tracing::info!(%connection, "Control connection closed");
}

/// Route one decoded frame. Returns a frame to write back directly, if any.
fn on_frame(
    hub: &HubHandle,
    connection: ConnectionId,
    outbound: &mut Option<mpsc::UnboundedSender<Frame>>,
    frame: Frame,
) -> Option<Frame> {
    match frame {
        Frame::BackendRegister { data } => {
            hub.register(connection, data, outbound.take());
            None
        }
        Frame::Heartbeat { .. } => Some(Frame::HeartbeatAck {
            timestamp: now_millis(),
        }),
        Frame::Ping { .. } => Some(Frame::Pong {
            timestamp: now_millis(),
        }),
        Frame::Pong { .. } | Frame::HeartbeatAck { .. } => None,
        Frame::ApiRequest { request_id, .. } => {
            tracing::warn!(%connection, job = %request_id, "Discarding api_request sent by a worker");
            None
        }
        frame => {
            hub.frame(connection, frame);
            None
        }
    }
}

async fn write_frame(sink: &mut WsSink, frame: &Frame) -> bool {
    let text = match FrameCodec::encode(frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode {} frame: {}", frame.kind(), e);
            return true;
        }
    };
    match sink.send(Message::Text(text.into())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Control socket write failed: {}", e);
            false
        }
    }
}
