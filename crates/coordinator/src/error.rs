use std::fmt;
use std::time::Duration;

use fleetload_common::{MessageError, ProcessOutcome};
use fleetload_scheduler::SchedulerError;
use fleetload_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no START received within {}ms", .0.as_millis())]
    StartTimeout(Duration),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("coordinator panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// Failure value a driver returns to stop the whole process.
///
/// Recovered from `anyhow::Error` with `downcast_ref`. Only
/// [`Severity::Error`] ends the drain early; a warning is logged like any
/// other failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{severity} abort: {reason}")]
pub struct AbortSignal {
    pub severity: Severity,
    pub reason: String,
}

impl AbortSignal {
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            reason: reason.into(),
        }
    }

    pub fn warning(reason: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn outcome(&self) -> ProcessOutcome {
        match self.severity {
            Severity::Error => ProcessOutcome::Error,
            Severity::Warning => ProcessOutcome::Successful,
        }
    }
}
