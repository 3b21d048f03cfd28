//! Sisi transport daemon.
//!
//! Runs the device listeners, WebSocket bridges and gateway front door and
//! logs the runtime status periodically.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use sisi_transport::{ControlCoordinator, TransportSupervisor, TransportTopology};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Sisi device transport and control plane.
#[derive(Debug, Parser)]
#[command(name = "sisi-transportd", version, about)]
struct Cli {
    /// JSON topology file; defaults apply when omitted.
    #[arg(short, long, env = "SISI_TRANSPORT_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between status log lines; 0 disables them.
    #[arg(long, default_value_t = 30)]
    status_interval_secs: u64,

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

    let topology = TransportTopology::load(cli.config.as_deref())?;
    info!(topology = ?topology.summary_fields(), "Starting Sisi transport");

    let supervisor = TransportSupervisor::new(topology, Arc::new(ControlCoordinator::default()));
    supervisor.start()?;

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("transport_signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received");
                }
            });
            let _ = stop_tx.send(());
        })?;

    let interval = Duration::from_secs(cli.status_interval_secs.max(1));
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if cli.status_interval_secs == 0 {
                    continue;
                }
                match serde_json::to_string(&supervisor.runtime_status()) {
                    Ok(status) => info!(status = %status, "transport status"),
                    Err(e) => warn!(error = %e, "failed to encode status"),
                }
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    supervisor.stop();
    Ok(())
}
