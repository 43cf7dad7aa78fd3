use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use fleetload_common::{ProcessIds, ProcessOutcome};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessContext {
    pub ids: ProcessIds,
    pub assignments: usize,
    pub started_at: DateTime<Utc>,
}

/// Hooks fired by the coordinator: once after setup, once with the final
/// outcome.
pub trait LifecycleListener: Send + Sync {
    fn on_process_started(&self, _ctx: &ProcessContext) {}

    fn on_process_finished(&self, _ctx: &ProcessContext, _outcome: ProcessOutcome) {}
}

pub(crate) struct LifecycleListeners {
    listeners: ArcSwap<Vec<Arc<dyn LifecycleListener>>>,
}

impl LifecycleListeners {
    pub fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.rcu(|current| {
            let mut next: Vec<Arc<dyn LifecycleListener>> = current.iter().cloned().collect();
            next.push(listener.clone());
            next
        });
    }

    pub fn started(&self, ctx: &ProcessContext) {
        for listener in self.listeners.load_full().iter() {
            listener.on_process_started(ctx);
        }
    }

    /// Runs after the terminal step, outside any recovery boundary, so a
    /// panicking listener is logged and the remaining ones still run.
    pub fn finished(&self, ctx: &ProcessContext, outcome: ProcessOutcome) {
        for listener in self.listeners.load_full().iter() {
            let notify = AssertUnwindSafe(|| listener.on_process_finished(ctx, outcome));
            if panic::catch_unwind(notify).is_err() {
                error!(process_id = ctx.ids.process_id, "Lifecycle listener panicked on finish");
            }
        }
    }
}
