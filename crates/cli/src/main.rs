// # -----------------------------
// # crates/cli/src/main.rs
// # -----------------------------
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetload_cli::{Console, RunOptions, RunReport};
use fleetload_common::config::{resolve_config_path, resolve_secret};
use fleetload_common::{FleetConfig, LoadProfile};
use fleetload_transport::TransportConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "fleetload", version)]
#[command(about = "Console for distributed fleetload runs")]
struct Cli {
    /// Log level (trace, debug, info, warn, error, off). Overrides RUST_LOG if set.
    #[arg(long = "log-level", global = true, value_name = "LEVEL")]
    log_level: Option<String>,
    /// Print results as JSON instead of one line per process
    #[arg(long, global = true)]
    json: bool,
    /// HMAC secret key (or use FLEETLOAD_SECRET env var)
    #[arg(long, global = true)]
    secret: Option<String>,
    /// Path to fleetload.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push a load profile to its daemons, start it and wait for every result
    Run {
        /// Load profile (TOML)
        #[arg(long)]
        profile: PathBuf,
        /// Binary artifact distributed to the test processes before CONFIG
        #[arg(long)]
        artifact: Option<PathBuf>,
        /// Wait at most this long for all processes to report READY
        #[arg(long, default_value_t = 30_000)]
        ready_timeout_ms: u64,
        /// Abort the run if it has not finished after this long
        #[arg(long)]
        run_timeout_ms: Option<u64>,
        /// Keep collecting results this long after an ABORT
        #[arg(long, default_value_t = 10_000)]
        abort_grace_ms: u64,
    },
    /// Send ABORT to every test process of the profile's daemons
    Abort {
        #[arg(long)]
        profile: PathBuf,
    },
    /// Show how many test processes are connected to each daemon
    Count {
        #[arg(long)]
        profile: PathBuf,
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Abort all test processes and stop the daemons
    Shutdown {
        #[arg(long)]
        profile: PathBuf,
    },
}

/// Initialize logging based on CLI arguments and environment
fn init_logging(log_level: Option<&str>) {
    let filter = match log_level.map(str::to_lowercase) {
        Some(level) => match level.as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => EnvFilter::new(level.as_str()),
            "warning" => EnvFilter::new("warn"),
            _ => {
                eprintln!("Warning: Invalid log level '{}', using 'info'", level);
                EnvFilter::new("info")
            }
        },
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    tracing::debug!("fleetload console {} ({})", VERSION, fleetload_build_info::build_id());

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = FleetConfig::load(config_path.as_deref()).context("load config")?;
    let transport = TransportConfig::from(&config.transport);
    let secret = resolve_secret(cli.secret);

    match cli.command {
        Commands::Run {
            profile,
            artifact,
            ready_timeout_ms,
            run_timeout_ms,
            abort_grace_ms,
        } => {
            let profile = LoadProfile::load(&profile)?;
            let artifact = match artifact {
                Some(path) => Some(
                    std::fs::read(&path)
                        .with_context(|| format!("failed to read artifact {}", path.display()))?,
                ),
                None => None,
            };
            let options = RunOptions {
                ready_timeout: Duration::from_millis(ready_timeout_ms),
                run_timeout: run_timeout_ms.map(Duration::from_millis),
                abort_grace: Duration::from_millis(abort_grace_ms),
            };

            let mut console = Console::connect(&profile.daemons, &secret, transport).await?;
            let stop = CancellationToken::new();
            spawn_interrupt_handler(stop.clone());
            let report = console
                .run(&profile, artifact.as_deref(), options, stop.clone())
                .await;
            console.disconnect().await;
            let report = report?;
            print_report(&report, cli.json)?;

            Ok(if stop.is_cancelled() {
                ExitCode::from(130)
            } else if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Commands::Abort { profile } => {
            let profile = LoadProfile::load(&profile)?;
            let console = Console::connect(&profile.daemons, &secret, transport).await?;
            console.abort().await?;
            console.disconnect().await;
            info!(daemons = profile.daemons.len(), "ABORT sent");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Count {
            profile,
            timeout_ms,
        } => {
            let profile = LoadProfile::load(&profile)?;
            let mut console = Console::connect(&profile.daemons, &secret, transport).await?;
            let counts = console
                .client_counts(Duration::from_millis(timeout_ms))
                .await;
            console.disconnect().await;
            let counts = counts?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                for (daemon_id, count) in counts {
                    println!("daemon {daemon_id}: {count} test processes");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Shutdown { profile } => {
            let profile = LoadProfile::load(&profile)?;
            let console = Console::connect(&profile.daemons, &secret, transport).await?;
            console.shutdown_daemons().await?;
            console.disconnect().await;
            info!(daemons = profile.daemons.len(), "SHUTDOWN sent");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        for line in report.lines() {
            println!("{line}");
        }
    }
    Ok(())
}

/// Ctrl+C during a run aborts it; the results gathered so far are still
/// printed.
fn spawn_interrupt_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C; aborting run");
            stop.cancel();
        }
    });
}
