use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetload_coordinator::{AbortSignal, Driver, ExecutionContext};
use tracing::{info, warn};

/// Milliseconds each operation pretends to take.
pub const LATENCY_PROPERTY: &str = "driver.simulated_latency_ms";
/// Operation name that makes the process abort with an error.
pub const ABORT_ON_PROPERTY: &str = "driver.abort_on";

/// Built-in driver: logs each operation and optionally simulates latency.
#[derive(Debug, Default)]
pub struct LoggingDriver {
    executed: AtomicUsize,
}

impl LoggingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    fn latency(ctx: &ExecutionContext) -> Option<Duration> {
        let raw = ctx.property(LATENCY_PROPERTY)?;
        match raw.trim().parse::<u64>() {
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(err) => {
                warn!("Invalid {} value '{}': {}", LATENCY_PROPERTY, raw, err);
                None
            }
        }
    }
}

#[async_trait]
impl Driver for LoggingDriver {
    async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        info!(
            process_id = ctx.ids.process_id,
            thread_id = ctx.thread_id,
            operation = %ctx.operation,
            target = %ctx.target,
            offset_ms = ctx.scheduled_offset.as_millis() as u64,
            "Executing operation"
        );

        if ctx.property(ABORT_ON_PROPERTY) == Some(ctx.operation.as_str()) {
            return Err(AbortSignal::error(format!(
                "operation {} on {} requested abort",
                ctx.operation, ctx.target
            ))
            .into());
        }

        if let Some(latency) = Self::latency(ctx) {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => {
                    info!(thread_id = ctx.thread_id, "Operation cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(latency) => {}
            }
        }

        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
