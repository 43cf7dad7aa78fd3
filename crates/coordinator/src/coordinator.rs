use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetload_common::{
    assignments_for, Envelope, FleetConfig, MessageError, OperationAssignment, ProcessConfig,
    ProcessIds, ProcessOutcome, StatusReport,
};
use fleetload_scheduler::{DelayScheduler, Outcome, SchedulerConfig};
use fleetload_transport::MessageListener;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::driver::{Driver, ExecutionContext};
use crate::error::{AbortSignal, CoordinatorError};
use crate::gate::{GateExit, StartGate};
use crate::lifecycle::{LifecycleListener, LifecycleListeners, ProcessContext};
use crate::uplink::Uplink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Setup,
    AwaitStart,
    Running,
    Draining,
    Finished(ProcessOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub start_timeout: Duration,
    pub disconnect_ack_timeout: Duration,
    /// How long after the last assignment's offset draining begins.
    pub poller_delay: Duration,
    pub termination_timeout: Duration,
    pub scheduler: SchedulerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&FleetConfig::default())
    }
}

impl From<&FleetConfig> for CoordinatorConfig {
    fn from(config: &FleetConfig) -> Self {
        Self {
            start_timeout: config.process.start_timeout(),
            disconnect_ack_timeout: config.process.disconnect_ack_timeout(),
            poller_delay: config.process.poller_delay(),
            termination_timeout: config.scheduler.termination_timeout(),
            scheduler: SchedulerConfig::from(&config.scheduler),
        }
    }
}

/// Delivers ABORT (or a hard interrupt) to a running coordinator from
/// outside, e.g. a signal handler.
#[derive(Clone)]
pub struct AbortHandle {
    gate: Arc<StartGate>,
}

impl AbortHandle {
    pub fn abort(&self) -> bool {
        self.gate.abort()
    }

    pub fn interrupt(&self) {
        self.gate.interrupt();
    }
}

/// Runs one test process from READY to its final outcome.
///
/// The outcome is reported upstream exactly once, followed by a
/// DISCONNECTED notification, on every exit path.
pub struct ProcessCoordinator {
    ids: ProcessIds,
    config: ProcessConfig,
    driver: Arc<dyn Driver>,
    link: Arc<dyn Uplink>,
    gate: Arc<StartGate>,
    settings: CoordinatorConfig,
    lifecycle: LifecycleListeners,
    state: watch::Sender<ProcessState>,
}

impl ProcessCoordinator {
    pub fn new(
        ids: ProcessIds,
        config: ProcessConfig,
        driver: Arc<dyn Driver>,
        link: Arc<dyn Uplink>,
        settings: CoordinatorConfig,
    ) -> Self {
        let (state, _) = watch::channel(ProcessState::Setup);
        Self {
            ids,
            config,
            driver,
            link,
            gate: Arc::new(StartGate::new(ids)),
            settings,
            lifecycle: LifecycleListeners::new(),
            state,
        }
    }

    /// Share a gate created earlier, so control signals seen before the
    /// coordinator existed still count.
    pub fn with_gate(mut self, gate: Arc<StartGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn ids(&self) -> ProcessIds {
        self.ids
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.lifecycle.add(listener);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            gate: self.gate.clone(),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub async fn run(self) -> ProcessOutcome {
        let assignments = assignments_for(&self.config.events, self.ids);
        let context = ProcessContext {
            ids: self.ids,
            assignments: assignments.len(),
            started_at: Utc::now(),
        };
        let listener = self.gate.listener();

        let executed = AssertUnwindSafe(self.execute(assignments, &context, &listener))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(CoordinatorError::Panicked(message))
            });

        let outcome = match executed {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    process_id = self.ids.process_id,
                    daemon_id = self.ids.daemon_id,
                    "Process failed: {}",
                    err
                );
                self.report_error(err.to_string()).await;
                ProcessOutcome::Error
            }
        };

        self.finish(outcome, &context).await;
        self.link.unsubscribe(&listener);
        outcome
    }

    async fn execute(
        &self,
        assignments: Vec<OperationAssignment>,
        context: &ProcessContext,
        listener: &Arc<dyn MessageListener>,
    ) -> Result<ProcessOutcome, CoordinatorError> {
        self.set_state(ProcessState::Setup);
        self.link.subscribe(listener.clone());
        self.lifecycle.started(context);
        info!(
            process_id = self.ids.process_id,
            daemon_id = self.ids.daemon_id,
            assignments = assignments.len(),
            "Process ready"
        );
        self.link.send(Envelope::ready(self.ids)?).await?;

        self.set_state(ProcessState::AwaitStart);
        match self.gate.wait_start(self.settings.start_timeout).await {
            GateExit::Started => {}
            GateExit::Aborted => {
                warn!(process_id = self.ids.process_id, "Aborted before start");
                return Ok(ProcessOutcome::Error);
            }
            GateExit::Interrupted => return Ok(ProcessOutcome::Interrupted),
            GateExit::TimedOut => {
                return Err(CoordinatorError::StartTimeout(self.settings.start_timeout))
            }
        }

        self.set_state(ProcessState::Running);
        let run_started = Instant::now();
        let scheduler = DelayScheduler::<()>::new(self.settings.scheduler);
        let properties = Arc::new(self.config.properties.clone());
        let total = assignments.len();
        let mut last_offset = Duration::ZERO;

        for assignment in assignments {
            let delay = assignment.start_offset();
            last_offset = last_offset.max(delay);
            let driver = self.driver.clone();
            let properties = properties.clone();
            let ids = self.ids;
            scheduler.schedule(
                move |cancellation| async move {
                    let ctx = ExecutionContext::new(ids, assignment, properties, cancellation);
                    debug!(
                        thread_id = ctx.thread_id,
                        operation = %ctx.operation,
                        target = %ctx.target,
                        "Executing operation"
                    );
                    driver.execute(&ctx).await
                },
                delay,
            )?;
        }

        // Draining starts only after the last offset; earlier completions
        // wait in the completion queue until then.
        let poll_at = run_started + last_offset + self.settings.poller_delay;
        tokio::select! {
            biased;
            _ = self.gate.interrupted() => {
                return Ok(self.stop(&scheduler, ProcessOutcome::Interrupted).await)
            }
            _ = self.gate.aborted() => {
                return Ok(self.stop(&scheduler, ProcessOutcome::Error).await)
            }
            _ = tokio::time::sleep_until(poll_at) => {}
        }

        self.set_state(ProcessState::Draining);
        for drained in 0..total {
            let completion = tokio::select! {
                biased;
                _ = self.gate.interrupted() => {
                    return Ok(self.stop(&scheduler, ProcessOutcome::Interrupted).await)
                }
                _ = self.gate.aborted() => {
                    return Ok(self.stop(&scheduler, ProcessOutcome::Error).await)
                }
                next = scheduler.take_next_completed() => next?,
            };

            let seq = completion.seq;
            let done = drained + 1;
            match completion.outcome {
                Outcome::Completed(()) => {
                    debug!(seq, done, total, "Operation completed");
                }
                Outcome::Cancelled => {
                    debug!(seq, "Operation cancelled");
                }
                Outcome::Failed(err) => {
                    let abort = err.downcast_ref::<AbortSignal>().cloned();
                    match abort {
                        Some(abort) if abort.is_fatal() => {
                            warn!(seq, reason = %abort.reason, "Operation aborted the process");
                            self.report_error(abort.to_string()).await;
                            return Ok(self.stop(&scheduler, abort.outcome()).await);
                        }
                        _ => warn!(seq, "Operation failed: {:#}", err),
                    }
                }
            }
            self.report_progress(done, total).await;
        }

        scheduler.shutdown();
        if !scheduler
            .await_termination(self.settings.termination_timeout)
            .await
        {
            warn!(process_id = self.ids.process_id, "Scheduler did not terminate in time");
        }
        Ok(ProcessOutcome::Successful)
    }

    async fn stop(
        &self,
        scheduler: &DelayScheduler<()>,
        outcome: ProcessOutcome,
    ) -> ProcessOutcome {
        let discarded = scheduler.shutdown_now();
        let terminated = scheduler
            .await_termination(self.settings.termination_timeout)
            .await;
        info!(
            process_id = self.ids.process_id,
            discarded,
            terminated,
            outcome = %outcome,
            "Scheduled work stopped"
        );
        outcome
    }

    async fn send_best_effort(&self, what: &str, envelope: Result<Envelope, MessageError>) {
        match envelope {
            Ok(envelope) => {
                if let Err(err) = self.link.send(envelope).await {
                    warn!("Failed to send {}: {}", what, err);
                }
            }
            Err(err) => warn!("Failed to encode {}: {}", what, err),
        }
    }

    async fn report_error(&self, message: String) {
        let report = StatusReport::new(self.ids, message).with_outcome(ProcessOutcome::Error);
        self.send_best_effort("ERROR status", Envelope::error(&report)).await;
    }

    /// Live STATUS after each drained operation. Carries no outcome.
    async fn report_progress(&self, done: usize, total: usize) {
        let report = StatusReport::new(self.ids, format!("{done}/{total} operations done"));
        self.send_best_effort("progress STATUS", Envelope::status(&report)).await;
    }

    /// Terminal step: final STATUS, DISCONNECTED, bounded wait for the
    /// acknowledgement, then lifecycle notification.
    async fn finish(&self, outcome: ProcessOutcome, context: &ProcessContext) {
        let line = format!(
            "{} finished {} ({} operations)",
            self.ids, outcome, context.assignments
        );
        let report = StatusReport::new(self.ids, line).with_outcome(outcome);
        self.send_best_effort("final STATUS", Envelope::status(&report)).await;
        self.send_best_effort("DISCONNECTED", Envelope::disconnected(self.ids)).await;

        let ack_timeout = self.settings.disconnect_ack_timeout;
        if !self.gate.wait_disconnect_ack(ack_timeout).await {
            warn!(
                process_id = self.ids.process_id,
                timeout_ms = ack_timeout.as_millis() as u64,
                "No disconnect acknowledgement; continuing"
            );
        }

        self.set_state(ProcessState::Finished(outcome));
        self.lifecycle.finished(context, outcome);
        info!(
            process_id = self.ids.process_id,
            daemon_id = self.ids.daemon_id,
            outcome = %outcome,
            "Process finished"
        );
    }

    fn set_state(&self, state: ProcessState) {
        self.state.send_replace(state);
    }
}
