use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetload_common::{OperationAssignment, ProcessIds};
use tokio_util::sync::CancellationToken;

/// Executes one scheduled operation. Implementations doing long external
/// calls should watch [`ExecutionContext::cancellation`].
///
/// Return an [`AbortSignal`](crate::AbortSignal) error to stop the process.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<()>;
}

/// Per-operation context, built on the worker that runs the operation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub ids: ProcessIds,
    pub thread_id: u32,
    pub operation: String,
    pub target: String,
    pub scheduled_offset: Duration,
    pub started_at: DateTime<Utc>,
    properties: Arc<BTreeMap<String, String>>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        ids: ProcessIds,
        assignment: OperationAssignment,
        properties: Arc<BTreeMap<String, String>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            ids,
            thread_id: assignment.thread_id,
            scheduled_offset: assignment.start_offset(),
            operation: assignment.operation,
            target: assignment.target,
            started_at: Utc::now(),
            properties,
            cancellation,
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
