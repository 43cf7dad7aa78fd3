//! Delay scheduler: runs work at a future offset on a dynamically sized
//! worker pool and hands back one completion per scheduled item.

mod completion;
mod pool;
mod queue;
mod scheduler;

use std::time::Duration;

use fleetload_common::SchedulerSettings;
use thiserror::Error;

pub use completion::{Completion, Outcome};
pub use pool::PoolMetrics;
pub use scheduler::{DelayScheduler, DoneHook, ScheduledTask};

/// Re-exported so work closures can name the token they receive.
pub use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    Shutdown,
    #[error("completion queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Idle workers exit after this long without work.
    pub worker_keep_alive: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            worker_keep_alive: settings.worker_keep_alive(),
        }
    }
}
