//! Worker side - outbound control connection and request handlers.
//!
//! Provides:
//! - [`WorkerClient`] - connects to a relay, registers and reconnects
//! - [`HandlerRegistry`] - maps method + path patterns to handlers
//! - [`RequestContext`] - lets handlers respond, stream, or fail
//!
//! # Example
//!
//! ```ignore
//! use relaywire::worker::{HandlerRegistry, ResponseKind};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("GET", "/api/projects", ResponseKind::Unary, |_: (), ctx| async move {
//!     ctx.respond(&serde_json::json!({ "projects": [] })).await
//! });
//!
//! registry.register("POST", "/api/chat", ResponseKind::Stream, |body: serde_json::Value, ctx| async move {
//!     ctx.chunk(body["message"].as_str().unwrap_or_default()).await?;
//!     ctx.end().await
//! });
//! ```

mod client;
mod context;
mod handler;
mod reconnect;
mod writer;

pub use client::{
    WorkerClient, WorkerClientBuilder, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_CONCURRENT_HANDLERS,
};
pub use context::{Phase, RequestContext};
pub use handler::{BoxFuture, Handler, HandlerRegistry, HandlerResult, ResponseKind, TypedHandler};
pub use reconnect::{
    Backoff, ConnectionState, ReconnectPolicy, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY,
};
pub use writer::{
    spawn_writer_task, WriterConfig, WriterHandle, DEFAULT_BACKPRESSURE_TIMEOUT,
    DEFAULT_CHANNEL_CAPACITY,
};
