//! # relaywire
//!
//! HTTP-to-worker relay.
//!
//! A publicly reachable relay accepts HTTP requests and hands each one, as a
//! job, to a worker that sits behind NAT and keeps an outbound WebSocket open
//! to the relay. Workers answer with a single response or a stream of chunks,
//! which the relay forwards to the waiting HTTP client.
//!
//! ## Architecture
//!
//! - **Relay** ([`relay`]): HTTP gateway, control connections, and a single
//!   dispatch loop owning the worker registry, pending jobs, and open streams
//! - **Worker** ([`worker`]): reconnecting client that registers with the
//!   relay and dispatches requests to route handlers
//! - **Protocol** ([`protocol`]): JSON frames shared by both sides
//!
//! ## Example
//!
//! ```ignore
//! use relaywire::worker::WorkerClient;
//!
//! #[tokio::main]
//! async fn main() -> relaywire::Result<()> {
//!     WorkerClient::builder("ws://localhost:3001/ws")
//!         .handle("GET", "/api/projects", |_: (), ctx| async move {
//!             ctx.respond(&serde_json::json!({ "projects": [] })).await
//!         })
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod error;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod worker;

pub use error::{JobError, RelaywireError, Result};
pub use relay::{serve, RelayConfig};
pub use worker::{RequestContext, WorkerClient, WorkerClientBuilder};
