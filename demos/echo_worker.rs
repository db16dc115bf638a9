//! Demo worker serving the relayed endpoint set with canned data.
//!
//! ```text
//! cargo run --bin relaywire-relay
//! cargo run --example echo_worker -- --relay-url ws://localhost:3001/ws
//! curl -N -X POST localhost:3001/api/chat -d '{"message":"hello there"}'
//! ```

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};

use relaywire::logging::{self, LogFormat};
use relaywire::worker::{
    WorkerClient, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY,
};

#[derive(Debug, Parser)]
#[command(name = "echo_worker")]
#[command(about = "Connects to a relay and answers requests with canned data")]
struct Args {
    /// Relay control endpoint.
    #[arg(long, env = "RELAY_URL", default_value = "ws://localhost:3001/ws")]
    relay_url: String,

    /// Backend id to register with. Defaults to `backend-<epoch ms>`.
    #[arg(long, env = "BACKEND_ID")]
    backend_id: Option<String>,

    /// Heartbeat interval in milliseconds.
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 30_000)]
    heartbeat_interval_ms: u64,

    /// Delay between reconnect attempts in milliseconds.
    #[arg(long, env = "RECONNECT_DELAY_MS", default_value_t = DEFAULT_RECONNECT_DELAY.as_millis() as u64)]
    reconnect_delay_ms: u64,

    /// Consecutive failed attempts before giving up.
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    max_reconnect_attempts: u32,

    /// Log at debug level.
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: String,
    #[serde(default)]
    request_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_format, if args.debug { "debug" } else { "info" });

    let mut builder = WorkerClient::builder(&args.relay_url)
        .handle_stream("POST", "/api/chat", |body: ChatRequest, ctx| async move {
            tracing::debug!(request_id = ?body.request_id, "Chat request");
            ctx.start_stream_with_type("application/x-ndjson").await?;
            for word in body.message.split_whitespace() {
                ctx.chunk_json(&json!({ "type": "delta", "text": word })).await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            ctx.chunk_json(&json!({ "type": "done" })).await?;
            ctx.end().await
        })
        .handle("GET", "/api/projects", |_: (), ctx| async move {
            ctx.respond(&json!({ "projects": [] })).await
        })
        .handle(
            "GET",
            "/api/projects/:encoded_project_name/histories",
            |_: (), ctx| async move {
                let project = ctx.param("encoded_project_name").unwrap_or_default().to_string();
                ctx.respond(&json!({ "project": project, "histories": [] })).await
            },
        )
        .handle(
            "GET",
            "/api/projects/:encoded_project_name/histories/:session_id",
            |_: (), ctx| async move {
                let session = ctx.param("session_id").unwrap_or_default().to_string();
                ctx.respond(&json!({ "sessionId": session, "messages": [] })).await
            },
        )
        .handle("POST", "/api/abort/:request_id", |_: Value, ctx| async move {
            let id = ctx.param("request_id").unwrap_or_default().to_string();
            ctx.respond(&json!({ "success": true, "requestId": id })).await
        })
        .heartbeat_interval(Duration::from_millis(args.heartbeat_interval_ms))
        .reconnect_delay(Duration::from_millis(args.reconnect_delay_ms))
        .max_reconnect_attempts(args.max_reconnect_attempts);

    if let Some(id) = args.backend_id {
        builder = builder.backend_id(id);
    }

    let client = builder.build()?;
    tracing::info!(
        relay = %client.url(),
        backend_id = %client.registration().backend_id,
        "Starting worker"
    );

    client
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
