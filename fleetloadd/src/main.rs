//! fleetload daemon
//!
//! Accepts console and test-process connections on one TCP port and relays
//! between them until a console sends SHUTDOWN or the process is signalled.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetload_common::config::{resolve_config_path, resolve_secret, DEFAULT_DAEMON_PORT};
use fleetload_common::FleetConfig;
use fleetload_transport::TransportConfig;
use fleetloadd::Relay;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "fleetloadd", version)]
#[command(about = "fleetload daemon: relays console traffic to local test processes")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// TCP port to listen on
    #[arg(long, default_value_t = DEFAULT_DAEMON_PORT)]
    port: u16,

    /// Id of this daemon in the load profile
    #[arg(long, default_value_t = 1)]
    daemon_id: u32,

    /// HMAC secret key (or use FLEETLOAD_SECRET env var)
    #[arg(long)]
    secret: Option<String>,

    /// Path to fleetload.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = FleetConfig::load(config_path.as_deref())
        .context("failed to load fleetload configuration")?;
    let secret = resolve_secret(cli.secret);

    info!(
        git = fleetload_build_info::git_label(),
        built = fleetload_build_info::build_timestamp(),
        "{}",
        fleetload_build_info::formatted_banner("fleetloadd", DAEMON_VERSION)
    );
    if let Some(path) = config_path.as_ref() {
        info!("Using configuration {}", path.display());
    }

    let relay = Arc::new(Relay::new(
        cli.daemon_id,
        format!("{}:{}", cli.host, cli.port),
        secret,
        TransportConfig::from(&config.transport),
    ));
    relay
        .start()
        .await
        .with_context(|| format!("failed to listen on {}:{}", cli.host, cli.port))?;

    spawn_signal_handlers(relay.clone());
    relay.shutdown_requested().await;
    relay.stop().await;
    info!(daemon_id = cli.daemon_id, "Daemon exited");
    Ok(())
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn spawn_signal_handlers(relay: Arc<Relay>) {
    let ctrl_c_relay = relay.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down daemon");
            shutdown_daemon(&ctrl_c_relay);
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down daemon");
                shutdown_daemon(&relay);
            }
        });
    }
}

fn shutdown_daemon(relay: &Relay) {
    if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
        return;
    }
    info!(
        connected_test_processes = relay.test_process_count(),
        connected_clients = relay.registry().len(),
        "Graceful shutdown initiated"
    );
    relay.request_shutdown();
}
