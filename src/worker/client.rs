//! Worker client builder and runtime loop.
//!
//! The [`WorkerClientBuilder`] provides a fluent API for registering route
//! handlers and tuning the connection. The [`WorkerClient`] manages the
//! lifecycle:
//! 1. Open the control connection to the relay
//! 2. Send `backend_register`
//! 3. Read frames and dispatch `api_request`s to handlers
//! 4. Reconnect after a fixed delay when the connection drops
//!
//! # Example
//!
//! ```ignore
//! use relaywire::worker::WorkerClient;
//!
//! #[tokio::main]
//! async fn main() -> relaywire::Result<()> {
//!     let client = WorkerClient::builder("ws://localhost:3001/ws")
//!         .handle("GET", "/api/projects", |_: (), ctx| async move {
//!             ctx.respond(&serde_json::json!({ "projects": [] })).await
//!         })
//!         .handle_stream("POST", "/api/chat", |body: serde_json::Value, ctx| async move {
//!             ctx.chunk(body.to_string()).await?;
//!             ctx.end().await
//!         })
//!         .build()?;
//!
//!     client.run().await
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{RelaywireError, Result};
use crate::protocol::{now_millis, Frame, FrameCodec, Registration, ResponsePayload};

use super::context::RequestContext;
use super::handler::{HandlerRegistry, HandlerResult, ResponseKind};
use super::reconnect::{Backoff, ConnectionState, ReconnectPolicy};
use super::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default interval between worker heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builder for configuring and creating a worker client.
pub struct WorkerClientBuilder {
    relay_url: String,
    backend_id: Option<String>,
    capabilities: Option<Vec<String>>,
    version: String,
    registry: HandlerRegistry,
    writer_config: WriterConfig,
    max_concurrent_handlers: usize,
    heartbeat_interval: Duration,
    reconnect: ReconnectPolicy,
}

impl WorkerClientBuilder {
    /// Create a builder for a worker that connects to `relay_url`.
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            backend_id: None,
            capabilities: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            registry: HandlerRegistry::new(),
            writer_config: WriterConfig::default(),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Register a handler that answers with a single response.
    ///
    /// The handler receives the deserialized request body and a context for
    /// responding.
    pub fn handle<F, T, Fut>(mut self, method: &str, pattern: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry
            .register(method, pattern, ResponseKind::Unary, handler);
        self
    }

    /// Register a handler that answers with a stream.
    ///
    /// Use `ctx.chunk()` to send chunks and `ctx.end()` to finish.
    pub fn handle_stream<F, T, Fut>(mut self, method: &str, pattern: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry
            .register(method, pattern, ResponseKind::Stream, handler);
        self
    }

    /// Set the backend id sent on registration.
    ///
    /// Default: `backend-<epoch ms>` at build time
    pub fn backend_id(mut self, id: impl Into<String>) -> Self {
        self.backend_id = Some(id.into());
        self
    }

    /// Set the declared capabilities.
    ///
    /// Default: the last literal segment of each registered route
    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(capabilities.into_iter().map(Into::into).collect());
        self
    }

    /// Set the declared version tag.
    ///
    /// Default: the crate version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// When this limit is reached, new requests are answered with 503.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit;
        self
    }

    /// Set the outbound frame queue capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    ///
    /// Default: 30 seconds
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the delay between reconnect attempts.
    ///
    /// Default: 5 seconds
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.delay = delay;
        self
    }

    /// Set the number of consecutive failed attempts before giving up.
    ///
    /// Default: 10
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    /// Validate the configuration and build the client.
    pub fn build(self) -> Result<WorkerClient> {
        let url = validate_relay_url(&self.relay_url)?;
        let registration = Registration {
            backend_id: self
                .backend_id
                .unwrap_or_else(|| format!("backend-{}", now_millis())),
            capabilities: self
                .capabilities
                .unwrap_or_else(|| self.registry.capabilities()),
            version: self.version,
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(WorkerClient {
            url,
            registration,
            registry: Arc::new(self.registry),
            writer_config: self.writer_config,
            max_concurrent_handlers: self.max_concurrent_handlers.max(1),
            heartbeat_interval: self.heartbeat_interval,
            reconnect: self.reconnect,
            state,
        })
    }
}

fn validate_relay_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(RelaywireError::Protocol(format!(
            "relay URL must use ws:// or wss://, got {}://",
            other
        ))),
    }
}

enum SessionEnd {
    Closed,
    Shutdown,
}

/// A worker connected (or connecting) to a relay.
pub struct WorkerClient {
    url: Url,
    registration: Registration,
    registry: Arc<HandlerRegistry>,
    writer_config: WriterConfig,
    max_concurrent_handlers: usize,
    heartbeat_interval: Duration,
    reconnect: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
}

impl WorkerClient {
    /// Create a new client builder.
    pub fn builder(relay_url: impl Into<String>) -> WorkerClientBuilder {
        WorkerClientBuilder::new(relay_url)
    }

    /// Relay URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Registration sent on every connection.
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run until reconnecting gives up.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves or reconnecting gives up.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut backoff = Backoff::new(self.reconnect);

        loop {
            let attempt = backoff.next_attempt();
            self.set_state(ConnectionState::Connecting { attempt });
            tracing::info!(url = %self.url, attempt, "Connecting to relay");

            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = &mut shutdown => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            };

            let delay = match connected {
                Ok((socket, _)) => {
                    backoff.reset();
                    let end = self.session(socket, shutdown.as_mut()).await;
                    self.set_state(ConnectionState::Disconnected);
                    match end {
                        Ok(SessionEnd::Shutdown) => return Ok(()),
                        Ok(SessionEnd::Closed) => tracing::warn!("Relay closed the connection"),
                        Err(e) => tracing::warn!("Relay connection lost: {}", e),
                    }
                    backoff.delay()
                }
                Err(e) => {
                    tracing::warn!(attempt, "Failed to connect to relay: {}", e);
                    match backoff.fail() {
                        Some(delay) => delay,
                        None => {
                            self.set_state(ConnectionState::GaveUp);
                            tracing::error!(
                                attempts = backoff.failures(),
                                "Giving up on relay connection"
                            );
                            return Err(RelaywireError::ReconnectExhausted(backoff.failures()));
                        }
                    }
                }
            };

            self.set_state(ConnectionState::Disconnected);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => return Ok(()),
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn session<F>(&self, socket: WsStream, mut shutdown: Pin<&mut F>) -> Result<SessionEnd>
    where
        F: Future<Output = ()>,
    {
        let (sink, mut stream) = socket.split();
        let (writer, writer_task) = spawn_writer_task(sink, self.writer_config.clone());

        writer
            .send(Frame::BackendRegister {
                data: self.registration.clone(),
            })
            .await?;
        self.set_state(ConnectionState::Registered);
        tracing::info!(
            backend_id = %self.registration.backend_id,
            capabilities = ?self.registration.capabilities,
            "Registered with relay"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_handlers));
        let mut handlers = JoinSet::new();
        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );

        let end = loop {
            tokio::select! {
                message = stream.next() => {
                    let frame = match message {
                        Some(Ok(Message::Text(text))) => FrameCodec::decode(&text),
                        Some(Ok(Message::Binary(bytes))) => FrameCodec::decode_bytes(&bytes),
                        Some(Ok(Message::Close(_))) | None => break Ok(SessionEnd::Closed),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Err(RelaywireError::from(e)),
                    };
                    match frame {
                        Ok(frame) => {
                            if let Err(e) = self.on_frame(frame, &writer, &semaphore, &mut handlers).await {
                                break Err(e);
                            }
                        }
                        Err(e) => tracing::warn!("Discarding malformed frame: {}", e),
                    }
                }
                _ = heartbeat.tick() => {
                    let beat = Frame::Heartbeat { timestamp: now_millis() };
                    if let Err(e) = writer.send(beat).await {
                        break Err(e);
                    }
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Handler panicked: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => break Ok(SessionEnd::Shutdown),
            }
        };

        // In-flight answers cannot reach the relay on a new connection.
        handlers.abort_all();
        while handlers.join_next().await.is_some() {}
        drop(writer);
        match writer_task.await {
            Ok(Err(e)) => tracing::debug!("Writer task ended: {}", e),
            Err(e) => tracing::debug!("Writer task failed: {}", e),
            Ok(Ok(())) => {}
        }
        end
    }

    async fn on_frame(
        &self,
        frame: Frame,
        writer: &WriterHandle,
        semaphore: &Arc<Semaphore>,
        handlers: &mut JoinSet<()>,
    ) -> Result<()> {
        match frame {
            Frame::ApiRequest { request_id, data } => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!(job = %request_id, "Handler capacity reached, rejecting request");
                        return writer
                            .send(Frame::ApiResponse {
                                request_id,
                                data: ResponsePayload::error("Backend at capacity", 503),
                            })
                            .await;
                    }
                };

                tracing::debug!(job = %request_id, method = %data.method, path = %data.path, "Dispatching request");
                let ctx = RequestContext::with_writer(request_id.clone(), writer.clone());
                let registry = self.registry.clone();
                handlers.spawn(async move {
                    // Permit is held until this task completes
                    let _permit = permit;
                    if let Err(e) = registry.dispatch(data, ctx).await {
                        tracing::error!(job = %request_id, "Handler error: {}", e);
                    }
                });
                Ok(())
            }
            Frame::Heartbeat { .. } => {
                writer
                    .send(Frame::HeartbeatAck {
                        timestamp: now_millis(),
                    })
                    .await
            }
            Frame::Ping { .. } => {
                writer
                    .send(Frame::Pong {
                        timestamp: now_millis(),
                    })
                    .await
            }
            Frame::HeartbeatAck { .. } | Frame::Pong { .. } => Ok(()),
            other => {
                tracing::warn!("Ignoring unexpected {} frame from relay", other.kind());
                Ok(())
            }
        }
    }
}
