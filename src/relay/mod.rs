//! Relay side: HTTP gateway, control connections and the dispatch loop.
//!
//! # Example
//!
//! ```ignore
//! use relaywire::relay::{serve, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> relaywire::Result<()> {
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3001").await?;
//!     serve(listener, RelayConfig::default(), async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```

mod config;
mod connection;
mod correlator;
mod gateway;
mod hub;
mod registry;
mod stream;

use std::future::Future;

use tokio::net::TcpListener;

use crate::error::Result;

pub use config::{RelayConfig, DEFAULT_PORT};
pub use connection::{ConnectionConfig, DEFAULT_LIVENESS_TIMEOUT, DEFAULT_PING_INTERVAL};
pub use correlator::{
    Correlator, JobHead, JobSink, PendingJob, Resolved, ResponseBody, StreamBody, StreamItem,
    UnaryResponse, DEFAULT_JOB_TIMEOUT,
};
pub use gateway::{router, GatewayState, DEFAULT_BODY_LIMIT};
pub use hub::{spawn_hub, spawn_hub_with_policy, HubConfig, HubEvent, HubHandle, HubStats};
pub use registry::{ConnectionId, FirstAvailable, FrameSender, SelectionPolicy, Worker, WorkerRegistry};
pub use stream::{ChunkOutcome, StreamRelay, StreamSummary, DEFAULT_STREAM_CONTENT_TYPE};

/// Run a relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: RelayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (hub, hub_task) = spawn_hub(config.hub());
    let state = GatewayState {
        hub,
        connection: config.connection(),
        body_limit: config.body_limit,
    };
    let app = router(state);

    tracing::info!(addr = %listener.local_addr()?, "Relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // Upgraded control sessions may outlive the server and keep the loop alive.
    hub_task.abort();
    tracing::info!("Relay stopped");
    Ok(())
}
