use tokio::time::Instant;

/// How a scheduled item finished.
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    Failed(anyhow::Error),
    /// Interrupted by `shutdown_now` before or while running.
    Cancelled,
}

/// Result of one scheduled item, published exactly once.
#[derive(Debug)]
pub struct Completion<T> {
    pub seq: u64,
    pub scheduled_for: Instant,
    pub started_at: Instant,
    pub finished_at: Instant,
    pub outcome: Outcome<T>,
}

impl<T> Completion<T> {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, Outcome::Cancelled)
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        match &self.outcome {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_result(self) -> anyhow::Result<Option<T>> {
        match self.outcome {
            Outcome::Completed(value) => Ok(Some(value)),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Ok(None),
        }
    }

    pub fn label(&self) -> &'static str {
        match self.outcome {
            Outcome::Completed(_) => "completed",
            Outcome::Failed(_) => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}
