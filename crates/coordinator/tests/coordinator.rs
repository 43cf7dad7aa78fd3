use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use fleetload_common::{
    Envelope, MessageType, ProcessConfig, ProcessIds, ProcessOutcome, ProfileEvent, StatusReport,
};
use fleetload_coordinator::{
    AbortSignal, CoordinatorConfig, Driver, ExecutionContext, LifecycleListener, ProcessContext,
    ProcessCoordinator, ProcessState, StartGate, Uplink,
};
use fleetload_scheduler::{CancellationToken, SchedulerConfig};
use fleetload_transport::{MessageListener, SendHandle, TransportError};
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

const IDS: ProcessIds = ProcessIds {
    process_id: 1,
    daemon_id: 1,
};

/// Records everything the coordinator sends and, when wired to a gate,
/// echoes DISCONNECTED back like the daemon does.
#[derive(Default)]
struct FakeUplink {
    sent: Mutex<Vec<Envelope>>,
    ack_to: OnceLock<Arc<StartGate>>,
    refuse: OnceLock<MessageType>,
    subscribed: AtomicUsize,
}

impl FakeUplink {
    fn acking(gate: &Arc<StartGate>) -> Arc<Self> {
        let link = Arc::new(Self::default());
        let _ = link.ack_to.set(gate.clone());
        link
    }

    fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acks like [`Self::acking`] but fails every send of `msg_type`.
    fn refusing(gate: &Arc<StartGate>, msg_type: MessageType) -> Arc<Self> {
        let link = Self::acking(gate);
        let _ = link.refuse.set(msg_type);
        link
    }

    fn types(&self) -> Vec<MessageType> {
        self.sent.lock().iter().map(Envelope::msg_type).collect()
    }

    fn reports(&self, msg_type: MessageType) -> Vec<StatusReport> {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.is(msg_type))
            .map(|e| e.decode().unwrap())
            .collect()
    }

    /// The STATUS that carries the outcome, sent by the terminal step.
    fn final_status(&self) -> StatusReport {
        let status = self.reports(MessageType::Status);
        let last = status.last().cloned().expect("final STATUS");
        assert!(last.outcome.is_some(), "last STATUS has no outcome");
        last
    }
}

impl Uplink for FakeUplink {
    fn send(&self, envelope: Envelope) -> SendHandle {
        if self.refuse.get() == Some(&envelope.msg_type()) {
            return SendHandle::ready(Err(TransportError::Closed));
        }
        if envelope.is(MessageType::Disconnected) {
            if let Some(gate) = self.ack_to.get() {
                gate.on_envelope(&envelope);
            }
        }
        self.sent.lock().push(envelope);
        SendHandle::ready(Ok(()))
    }

    fn subscribe(&self, _listener: Arc<dyn MessageListener>) {
        self.subscribed.fetch_add(1, Ordering::SeqCst);
    }

    fn unsubscribe(&self, _listener: &Arc<dyn MessageListener>) {
        self.subscribed.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
enum Script {
    Succeed(u64),
    Abort(bool),
    Fail,
    Hang,
}

#[derive(Default)]
struct ScriptedDriver {
    scripts: BTreeMap<&'static str, Script>,
    calls: Mutex<Vec<(u32, String, u64)>>,
    hung: Mutex<Vec<CancellationToken>>,
}

impl ScriptedDriver {
    fn new(scripts: &[(&'static str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts.iter().copied().collect(),
            ..Self::default()
        })
    }

    fn operations(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, op, _)| op.clone()).collect()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn execute(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.calls.lock().push((
            ctx.thread_id,
            ctx.operation.clone(),
            ctx.scheduled_offset.as_millis() as u64,
        ));
        let script = self
            .scripts
            .get(ctx.operation.as_str())
            .copied()
            .unwrap_or(Script::Succeed(0));
        match script {
            Script::Succeed(ms) => {
                sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
            Script::Abort(fatal) => {
                let signal = if fatal {
                    AbortSignal::error(format!("{} rejected", ctx.operation))
                } else {
                    AbortSignal::warning("slow target")
                };
                Err(signal.into())
            }
            Script::Fail => Err(anyhow!("connection refused by {}", ctx.target)),
            Script::Hang => {
                self.hung.lock().push(ctx.cancellation().clone());
                ctx.cancellation().cancelled().await;
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct CountingListener {
    started: AtomicUsize,
    finished: Mutex<Vec<ProcessOutcome>>,
}

impl LifecycleListener for CountingListener {
    fn on_process_started(&self, ctx: &ProcessContext) {
        assert_eq!(ctx.ids, IDS);
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_process_finished(&self, _ctx: &ProcessContext, outcome: ProcessOutcome) {
        self.finished.lock().push(outcome);
    }
}

struct PanickingListener {
    on_start: bool,
}

impl LifecycleListener for PanickingListener {
    fn on_process_started(&self, _ctx: &ProcessContext) {
        if self.on_start {
            panic!("listener blew up on start");
        }
    }

    fn on_process_finished(&self, _ctx: &ProcessContext, _outcome: ProcessOutcome) {
        if !self.on_start {
            panic!("listener blew up on finish");
        }
    }
}

fn settings() -> CoordinatorConfig {
    CoordinatorConfig {
        start_timeout: Duration::from_secs(10),
        disconnect_ack_timeout: Duration::from_secs(5),
        poller_delay: Duration::from_millis(50),
        termination_timeout: Duration::from_secs(1),
        scheduler: SchedulerConfig {
            worker_keep_alive: Duration::from_secs(1),
        },
    }
}

fn event(offset_ms: u64, operation: &str, process_id: u32) -> ProfileEvent {
    ProfileEvent {
        offset_ms,
        operation: operation.to_string(),
        target: "http://target.local".to_string(),
        daemon_id: 1,
        process_id,
    }
}

fn profile(events: Vec<ProfileEvent>) -> ProcessConfig {
    ProcessConfig {
        events,
        properties: BTreeMap::new(),
    }
}

fn coordinator(
    config: ProcessConfig,
    driver: &Arc<ScriptedDriver>,
    link: &Arc<FakeUplink>,
    gate: &Arc<StartGate>,
) -> ProcessCoordinator {
    ProcessCoordinator::new(IDS, config, driver.clone(), link.clone(), settings())
        .with_gate(gate.clone())
}

#[tokio::test(start_paused = true)]
async fn happy_path_reports_success_after_every_operation() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[("c", Script::Succeed(30))]);
    let config = profile(vec![
        event(0, "a", 1),
        event(50, "b", 1),
        event(40, "other", 2),
        event(100, "c", 1),
    ]);
    let coordinator = coordinator(config, &driver, &link, &gate);
    let lifecycle = Arc::new(CountingListener::default());
    coordinator.add_lifecycle_listener(lifecycle.clone());
    let state = coordinator.subscribe_state();
    assert_eq!(coordinator.state(), ProcessState::Setup);

    gate.release();
    let outcome = coordinator.run().await;

    assert_eq!(outcome, ProcessOutcome::Successful);
    assert_eq!(*state.borrow(), ProcessState::Finished(ProcessOutcome::Successful));
    assert_eq!(
        link.types(),
        vec![
            MessageType::Ready,
            MessageType::Status,
            MessageType::Status,
            MessageType::Status,
            MessageType::Status,
            MessageType::Disconnected
        ]
    );

    let ready: ProcessIds = link.sent.lock()[0].decode().unwrap();
    assert_eq!(ready, IDS);
    let status = link.reports(MessageType::Status);
    let progress: Vec<(&str, Option<ProcessOutcome>)> = status[..3]
        .iter()
        .map(|r| (r.message.as_str(), r.outcome))
        .collect();
    assert_eq!(
        progress,
        vec![
            ("1/3 operations done", None),
            ("2/3 operations done", None),
            ("3/3 operations done", None),
        ]
    );
    let last = link.final_status();
    assert_eq!(last.outcome, Some(ProcessOutcome::Successful));
    assert!(last.message.contains("3 operations"));

    let mut calls = driver.calls.lock().clone();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            (1, "a".to_string(), 0),
            (2, "b".to_string(), 50),
            (3, "c".to_string(), 100),
        ]
    );
    assert_eq!(lifecycle.started.load(Ordering::SeqCst), 1);
    assert_eq!(*lifecycle.finished.lock(), vec![ProcessOutcome::Successful]);
    assert_eq!(link.subscribed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn abort_before_start_runs_nothing() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[]);
    let coordinator = coordinator(profile(vec![event(0, "a", 1)]), &driver, &link, &gate);

    let handle = coordinator.abort_handle();
    let task = tokio::spawn(coordinator.run());
    sleep(Duration::from_millis(200)).await;
    assert!(handle.abort());

    assert_eq!(task.await.unwrap(), ProcessOutcome::Error);
    assert!(driver.calls.lock().is_empty());
    assert_eq!(
        link.types(),
        vec![MessageType::Ready, MessageType::Status, MessageType::Disconnected]
    );
    assert_eq!(link.final_status().outcome, Some(ProcessOutcome::Error));
}

#[tokio::test(start_paused = true)]
async fn missing_start_is_reported_as_error() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[]);
    let coordinator = coordinator(profile(vec![event(0, "a", 1)]), &driver, &link, &gate);

    let began = Instant::now();
    assert_eq!(coordinator.run().await, ProcessOutcome::Error);
    assert!(began.elapsed() >= Duration::from_secs(10));
    assert!(driver.calls.lock().is_empty());

    assert_eq!(
        link.types(),
        vec![
            MessageType::Ready,
            MessageType::Error,
            MessageType::Status,
            MessageType::Disconnected
        ]
    );
    let error = &link.reports(MessageType::Error)[0];
    assert!(error.message.contains("no START"), "{}", error.message);
}

#[tokio::test(start_paused = true)]
async fn fatal_abort_from_an_operation_cancels_the_rest() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[("b", Script::Abort(true)), ("c", Script::Hang)]);
    let config = profile(vec![event(0, "a", 1), event(50, "b", 1), event(100, "c", 1)]);
    let coordinator = coordinator(config, &driver, &link, &gate);

    gate.release();
    assert_eq!(coordinator.run().await, ProcessOutcome::Error);

    assert_eq!(driver.operations().len(), 3);
    let hung = driver.hung.lock();
    assert_eq!(hung.len(), 1);
    assert!(hung[0].is_cancelled());

    let error = &link.reports(MessageType::Error)[0];
    assert_eq!(error.message, "error abort: b rejected");
    assert_eq!(link.final_status().outcome, Some(ProcessOutcome::Error));
}

#[tokio::test(start_paused = true)]
async fn warnings_and_plain_failures_do_not_fail_the_process() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[("a", Script::Abort(false)), ("b", Script::Fail)]);
    let config = profile(vec![event(0, "a", 1), event(10, "b", 1), event(20, "c", 1)]);
    let coordinator = coordinator(config, &driver, &link, &gate);

    gate.release();
    assert_eq!(coordinator.run().await, ProcessOutcome::Successful);
    assert!(link.reports(MessageType::Error).is_empty());
    let progress = link.reports(MessageType::Status);
    assert_eq!(progress.len(), 4);
    assert_eq!(progress[2].message, "3/3 operations done");
}

#[tokio::test(start_paused = true)]
async fn abort_while_draining_ends_with_error() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[("slow", Script::Hang)]);
    let config = profile(vec![event(0, "fast", 1), event(10, "slow", 1)]);
    let coordinator = coordinator(config, &driver, &link, &gate);
    let state = coordinator.subscribe_state();

    gate.release();
    let task = tokio::spawn(coordinator.run());
    sleep(Duration::from_millis(500)).await;
    assert_eq!(*state.borrow(), ProcessState::Draining);
    gate.on_envelope(&Envelope::signal(MessageType::Abort));

    assert_eq!(task.await.unwrap(), ProcessOutcome::Error);
    assert!(driver.hung.lock()[0].is_cancelled());
    assert!(link.reports(MessageType::Error).is_empty());
}

#[tokio::test(start_paused = true)]
async fn interrupt_while_running_is_reported_as_interrupted() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[("a", Script::Hang)]);
    let config = profile(vec![event(0, "a", 1), event(5_000, "late", 1)]);
    let coordinator = coordinator(config, &driver, &link, &gate);
    let handle = coordinator.abort_handle();
    let state = coordinator.subscribe_state();

    gate.release();
    let task = tokio::spawn(coordinator.run());
    sleep(Duration::from_millis(300)).await;
    assert_eq!(*state.borrow(), ProcessState::Running);
    handle.interrupt();

    assert_eq!(task.await.unwrap(), ProcessOutcome::Interrupted);
    assert_eq!(driver.operations(), vec!["a".to_string()]);
    assert_eq!(link.final_status().outcome, Some(ProcessOutcome::Interrupted));
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_disconnect_still_finishes() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::silent();
    let driver = ScriptedDriver::new(&[]);
    let coordinator = coordinator(profile(vec![event(0, "a", 1)]), &driver, &link, &gate);

    gate.release();
    let began = Instant::now();
    assert_eq!(coordinator.run().await, ProcessOutcome::Successful);
    assert!(began.elapsed() >= Duration::from_secs(5));
    assert_eq!(link.types().last(), Some(&MessageType::Disconnected));
}

#[tokio::test(start_paused = true)]
async fn process_without_assignments_succeeds() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[]);
    let coordinator = coordinator(profile(vec![event(0, "a", 7)]), &driver, &link, &gate);

    gate.release();
    assert_eq!(coordinator.run().await, ProcessOutcome::Successful);
    assert!(driver.calls.lock().is_empty());
    assert!(link.final_status().message.contains("0 operations"));
}

#[tokio::test(start_paused = true)]
async fn panic_during_setup_is_reported_and_still_finishes() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[]);
    let coordinator = coordinator(profile(vec![event(0, "a", 1)]), &driver, &link, &gate);
    let lifecycle = Arc::new(CountingListener::default());
    coordinator.add_lifecycle_listener(lifecycle.clone());
    coordinator.add_lifecycle_listener(Arc::new(PanickingListener { on_start: true }));
    let state = coordinator.subscribe_state();

    gate.release();
    assert_eq!(coordinator.run().await, ProcessOutcome::Error);

    assert_eq!(
        link.types(),
        vec![MessageType::Error, MessageType::Status, MessageType::Disconnected]
    );
    let error = &link.reports(MessageType::Error)[0];
    assert!(error.message.contains("listener blew up on start"), "{}", error.message);
    assert_eq!(link.final_status().outcome, Some(ProcessOutcome::Error));
    assert!(driver.calls.lock().is_empty());
    assert_eq!(*lifecycle.finished.lock(), vec![ProcessOutcome::Error]);
    assert_eq!(*state.borrow(), ProcessState::Finished(ProcessOutcome::Error));
    assert_eq!(link.subscribed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_ready_send_is_reported_and_still_finishes() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::refusing(&gate, MessageType::Ready);
    let driver = ScriptedDriver::new(&[]);
    let coordinator = coordinator(profile(vec![event(0, "a", 1)]), &driver, &link, &gate);
    let lifecycle = Arc::new(CountingListener::default());
    coordinator.add_lifecycle_listener(lifecycle.clone());

    gate.release();
    assert_eq!(coordinator.run().await, ProcessOutcome::Error);

    assert_eq!(
        link.types(),
        vec![MessageType::Error, MessageType::Status, MessageType::Disconnected]
    );
    assert_eq!(link.final_status().outcome, Some(ProcessOutcome::Error));
    assert!(driver.calls.lock().is_empty());
    assert_eq!(lifecycle.started.load(Ordering::SeqCst), 1);
    assert_eq!(*lifecycle.finished.lock(), vec![ProcessOutcome::Error]);
}

#[tokio::test(start_paused = true)]
async fn panicking_finish_listener_does_not_skip_the_others() {
    let gate = Arc::new(StartGate::new(IDS));
    let link = FakeUplink::acking(&gate);
    let driver = ScriptedDriver::new(&[]);
    let coordinator = coordinator(profile(vec![event(0, "a", 1)]), &driver, &link, &gate);
    coordinator.add_lifecycle_listener(Arc::new(PanickingListener { on_start: false }));
    let lifecycle = Arc::new(CountingListener::default());
    coordinator.add_lifecycle_listener(lifecycle.clone());
    let state = coordinator.subscribe_state();

    gate.release();
    assert_eq!(coordinator.run().await, ProcessOutcome::Successful);
    assert_eq!(*state.borrow(), ProcessState::Finished(ProcessOutcome::Successful));
    assert_eq!(*lifecycle.finished.lock(), vec![ProcessOutcome::Successful]);
}
