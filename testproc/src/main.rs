//! fleetload test process
//!
//! Started once per process id on a load-generating host. Connects to the
//! local daemon, waits for its CONFIG and START, fires its operations and
//! reports the outcome.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetload_common::config::{resolve_config_path, resolve_secret, DEFAULT_DAEMON_PORT};
use fleetload_common::{FleetConfig, ProcessIds, ProcessOutcome};
use fleetload_coordinator::StartGate;
use fleetload_testproc::{LoggingDriver, TestProcessHost};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

static SIGNALS_RECEIVED: AtomicUsize = AtomicUsize::new(0);

#[derive(Parser, Debug)]
#[command(name = "fleetload-testproc", version)]
#[command(about = "Runs one test process of a fleetload load profile")]
struct Cli {
    /// Id of this test process
    #[arg(long)]
    process_id: u32,

    /// Id of the daemon this process belongs to
    #[arg(long)]
    daemon_id: u32,

    /// Daemon host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Daemon port
    #[arg(long, default_value_t = DEFAULT_DAEMON_PORT)]
    port: u16,

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
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = FleetConfig::load(config_path.as_deref())
        .context("failed to load fleetload configuration")?;
    let secret = resolve_secret(cli.secret);
    let ids = ProcessIds::new(cli.process_id, cli.daemon_id);

    info!(
        git = fleetload_build_info::git_label(),
        built = fleetload_build_info::build_timestamp(),
        "{}",
        fleetload_build_info::formatted_banner("fleetload-testproc", env!("CARGO_PKG_VERSION"))
    );

    let host = TestProcessHost::new(ids, format!("{}:{}", cli.host, cli.port), secret, config);
    spawn_signal_handlers(host.gate());

    let outcome = match host.run(Arc::new(LoggingDriver::new())).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(process_id = ids.process_id, "Test process failed: {:#}", err);
            ProcessOutcome::Error
        }
    };
    Ok(exit_code(outcome))
}

fn exit_code(outcome: ProcessOutcome) -> ExitCode {
    match outcome {
        ProcessOutcome::Successful => ExitCode::SUCCESS,
        ProcessOutcome::Error => ExitCode::from(1),
        ProcessOutcome::Interrupted => ExitCode::from(130),
    }
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

fn spawn_signal_handlers(gate: Arc<StartGate>) {
    let ctrl_c_gate = gate.clone();
    tokio::spawn(async move {
        while signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            on_signal(&ctrl_c_gate);
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
            while sigterm.recv().await.is_some() {
                info!("Received SIGTERM");
                on_signal(&gate);
            }
        });
    }
}

/// First signal aborts like an ABORT envelope; any further one interrupts.
fn on_signal(gate: &StartGate) {
    if SIGNALS_RECEIVED.fetch_add(1, Ordering::SeqCst) == 0 {
        warn!(process_id = gate.ids().process_id, "Aborting test process");
        gate.abort();
    } else {
        warn!(process_id = gate.ids().process_id, "Interrupting test process");
        gate.interrupt();
    }
}
