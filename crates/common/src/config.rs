//! # Runtime configuration
//!
//! Shared by the daemon, the test-process host and the console.
//!
//! Configuration is resolved from multiple sources in order of precedence:
//! 1. Command-line flags (applied by each binary)
//! 2. Environment variables (`FLEETLOAD_*`)
//! 3. Configuration file (`--config`, `FLEETLOAD_CONFIG`, or `./fleetload.toml`)
//! 4. Built-in defaults

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_SECRET: &str = "change-me-in-production";
pub const CONFIG_FILE_NAME: &str = "fleetload.toml";
pub const DEFAULT_DAEMON_PORT: u16 = 7400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub transport: TransportSettings,
    pub scheduler: SchedulerSettings,
    pub process: ProcessSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Upper bound for the identity exchange on a new connection.
    pub handshake_timeout_ms: u64,
    /// Grace period for flushing queued writes on disconnect.
    pub disconnect_timeout_ms: u64,
    /// Longest inbound frame accepted before the connection is dropped.
    /// JAR payloads travel as one frame, so keep this above the artifact size.
    pub max_frame_bytes: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            disconnect_timeout_ms: 2_000,
            max_frame_bytes: 64 * 1024 * 1024,
        }
    }
}

impl TransportSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Idle workers are reclaimed after this long without work.
    pub worker_keep_alive_ms: u64,
    /// How long a shut-down scheduler may take to finish in-flight work.
    pub termination_timeout_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_keep_alive_ms: 60_000,
            termination_timeout_ms: 5_000,
        }
    }
}

impl SchedulerSettings {
    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_millis(self.worker_keep_alive_ms)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    pub start_timeout_ms: u64,
    pub disconnect_ack_timeout_ms: u64,
    /// Delay of the completion poller past the last assignment's offset.
    pub poller_delay_ms: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            start_timeout_ms: 10_000,
            disconnect_ack_timeout_ms: 5_000,
            poller_delay_ms: 50,
        }
    }
}

impl ProcessSettings {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn disconnect_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_ack_timeout_ms)
    }

    pub fn poller_delay(&self) -> Duration {
        Duration::from_millis(self.poller_delay_ms)
    }
}

impl FleetConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load the file when one resolves, fall back to defaults otherwise, then
    /// apply `FLEETLOAD_*` overrides from the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match resolve_config_path(explicit) {
            Some(path) => {
                let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::from_toml_str(&raw, &path)?
            }
            None => Self::default(),
        };
        config.apply_env_with(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides through `lookup`, which maps a variable name to its
    /// value. Invalid numbers are logged and ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<u64>() {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!("Invalid {} value '{}': {}", key, raw, err);
                    None
                }
            }
        };

        if let Some(v) = read("FLEETLOAD_HANDSHAKE_TIMEOUT_MS") {
            self.transport.handshake_timeout_ms = v;
        }
        if let Some(v) = read("FLEETLOAD_DISCONNECT_TIMEOUT_MS") {
            self.transport.disconnect_timeout_ms = v;
        }
        if let Some(v) = read("FLEETLOAD_MAX_FRAME_BYTES") {
            self.transport.max_frame_bytes = v as usize;
        }
        if let Some(v) = read("FLEETLOAD_WORKER_KEEP_ALIVE_MS") {
            self.scheduler.worker_keep_alive_ms = v;
        }
        if let Some(v) = read("FLEETLOAD_TERMINATION_TIMEOUT_MS") {
            self.scheduler.termination_timeout_ms = v;
        }
        if let Some(v) = read("FLEETLOAD_START_TIMEOUT_MS") {
            self.process.start_timeout_ms = v;
        }
        if let Some(v) = read("FLEETLOAD_DISCONNECT_ACK_TIMEOUT_MS") {
            self.process.disconnect_ack_timeout_ms = v;
        }
        if let Some(v) = read("FLEETLOAD_POLLER_DELAY_MS") {
            self.process.poller_delay_ms = v;
        }
    }
}

/// `--config` first, then `FLEETLOAD_CONFIG`, then `./fleetload.toml` if it
/// exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env::var("FLEETLOAD_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = env::current_dir().ok()?.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        })
}

/// Shared handshake secret from the CLI or `FLEETLOAD_SECRET`.
pub fn resolve_secret(cli: Option<String>) -> String {
    let secret = cli
        .or_else(|| env::var("FLEETLOAD_SECRET").ok())
        .unwrap_or_else(|| DEFAULT_SECRET.to_string());
    if secret == DEFAULT_SECRET {
        warn!("Using default secret - set FLEETLOAD_SECRET in production!");
    }
    secret
}
