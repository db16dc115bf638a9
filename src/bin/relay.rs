//! Relay binary: public HTTP gateway plus control endpoint for workers.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use relaywire::logging::{self, LogFormat};
use relaywire::relay::{serve, RelayConfig, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(name = "relaywire-relay")]
#[command(about = "Relays HTTP requests to workers connected over WebSocket")]
#[command(version)]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Interface to bind.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: std::net::IpAddr,

    /// Deadline for a worker to answer or start streaming, in milliseconds.
    #[arg(long, env = "RELAY_JOB_TIMEOUT_MS", default_value_t = 120_000)]
    job_timeout_ms: u64,

    /// Interval between pings on control connections, in milliseconds.
    #[arg(long, env = "RELAY_PING_INTERVAL_MS", default_value_t = 30_000)]
    ping_interval_ms: u64,

    /// Close control connections silent for this long, in milliseconds.
    #[arg(long, env = "RELAY_LIVENESS_TIMEOUT_MS", default_value_t = 90_000)]
    liveness_timeout_ms: u64,

    /// Fail pending jobs with 502 as soon as their worker disconnects.
    #[arg(long, env = "RELAY_FAIL_PENDING_ON_DISCONNECT")]
    fail_pending_on_disconnect: bool,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Args {
    fn config(&self) -> RelayConfig {
        RelayConfig::default()
            .listen(SocketAddr::new(self.host, self.port))
            .job_timeout(Duration::from_millis(self.job_timeout_ms))
            .ping_interval(Duration::from_millis(self.ping_interval_ms))
            .liveness_timeout(Duration::from_millis(self.liveness_timeout_ms))
            .fail_pending_on_disconnect(self.fail_pending_on_disconnect)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_format, &args.log_level);

    let config = args.config();
    tracing::info!(
        address = %config.listen,
        job_timeout_ms = args.job_timeout_ms,
        fail_pending_on_disconnect = config.fail_pending_on_disconnect,
        "Starting relay"
    );

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    serve(listener, config, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
