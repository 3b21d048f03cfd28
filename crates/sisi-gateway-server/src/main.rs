//! Sisi gateway binary.
//!
//! Front door for devices (`/device`) and app clients (`/control`).

use clap::Parser;
use sisi_gateway_server::{GatewayConfig, GatewayServer, DEFAULT_MAX_MESSAGE_BYTES};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Sisi app-layer WebSocket gateway.
#[derive(Debug, Parser)]
#[command(name = "sisi-gateway", version, about)]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind.
    #[arg(long, default_value_t = 9102)]
    port: u16,

    /// Media backend WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:9002")]
    media_backend: String,

    /// Control backend WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:9003")]
    control_backend: String,

    /// Required access token; empty disables the check.
    #[arg(long, env = "SISI_GATEWAY_TOKEN", default_value = "")]
    access_token: String,

    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase())),
        )
        .init();

    let config = GatewayConfig::new(cli.host, cli.port)
        .with_media_backend(cli.media_backend)
        .with_control_backend(cli.control_backend)
        .with_access_token(cli.access_token)
        .with_max_message_bytes(cli.max_message_bytes);
    let server = GatewayServer::new(config)?;

    info!("Starting Sisi gateway on {}", server.config().bind_target());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let handle = server.shutdown_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                handle.shutdown();
            }
        });
        server.run_forever().await
    })?;

    Ok(())
}
