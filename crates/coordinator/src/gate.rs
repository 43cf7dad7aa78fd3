use std::sync::Arc;
use std::time::Duration;

use fleetload_common::{Envelope, MessageType, ProcessIds};
use fleetload_transport::{Connection, MessageListener};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartSignal {
    Waiting,
    Started,
    Aborted,
}

/// How the wait for START ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateExit {
    Started,
    Aborted,
    Interrupted,
    TimedOut,
}

/// Control signals of one test process.
///
/// Everything here only flips state and wakes waiters, so it is safe to call
/// from a transport reader task or a signal handler. The blocking side
/// lives on the coordinator's own task.
pub struct StartGate {
    ids: ProcessIds,
    start: watch::Sender<StartSignal>,
    disconnect_ack: watch::Sender<bool>,
    interrupt: CancellationToken,
}

impl StartGate {
    pub fn new(ids: ProcessIds) -> Self {
        let (start, _) = watch::channel(StartSignal::Waiting);
        let (disconnect_ack, _) = watch::channel(false);
        Self {
            ids,
            start,
            disconnect_ack,
            interrupt: CancellationToken::new(),
        }
    }

    pub fn ids(&self) -> ProcessIds {
        self.ids
    }

    /// START: opens the gate unless an abort got there first.
    pub fn release(&self) -> bool {
        self.start.send_if_modified(|signal| {
            if *signal == StartSignal::Waiting {
                *signal = StartSignal::Started;
                true
            } else {
                false
            }
        })
    }

    /// ABORT: releases a waiting gate and marks the process aborted. Valid
    /// at any point, also after START.
    pub fn abort(&self) -> bool {
        self.start.send_if_modified(|signal| {
            if *signal == StartSignal::Aborted {
                false
            } else {
                *signal = StartSignal::Aborted;
                true
            }
        })
    }

    pub fn is_aborted(&self) -> bool {
        *self.start.borrow() == StartSignal::Aborted
    }

    /// Cancel the coordinator's waits outright; the outcome becomes
    /// INTERRUPTED.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    pub fn acknowledge_disconnect(&self) {
        self.disconnect_ack.send_replace(true);
    }

    /// Apply an inbound control envelope. Returns `true` if it changed
    /// anything.
    pub fn on_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.msg_type() {
            MessageType::Start => {
                let released = self.release();
                if released {
                    info!(process_id = self.ids.process_id, "START received");
                }
                released
            }
            MessageType::Abort => {
                let aborted = self.abort();
                if aborted {
                    warn!(process_id = self.ids.process_id, "ABORT received");
                }
                aborted
            }
            MessageType::Disconnected => match envelope.decode::<ProcessIds>() {
                Ok(ids) if ids == self.ids => {
                    debug!(process_id = ids.process_id, "Disconnect acknowledged");
                    self.acknowledge_disconnect();
                    true
                }
                Ok(ids) => {
                    debug!(%ids, "Ignoring acknowledgement for another process");
                    false
                }
                Err(err) => {
                    warn!("Malformed DISCONNECTED acknowledgement: {}", err);
                    false
                }
            },
            _ => false,
        }
    }

    /// Block until START, ABORT, an interrupt, or `limit` elapses. An
    /// interrupt wins over everything else.
    pub async fn wait_start(&self, limit: Duration) -> GateExit {
        let mut rx = self.start.subscribe();
        let signalled = tokio::time::timeout(
            limit,
            rx.wait_for(|signal| *signal != StartSignal::Waiting),
        );
        tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => GateExit::Interrupted,
            waited = signalled => match waited {
                Ok(Ok(signal)) if *signal == StartSignal::Started => GateExit::Started,
                Ok(_) => GateExit::Aborted,
                Err(_) => GateExit::TimedOut,
            },
        }
    }

    /// Resolves once the process has been aborted.
    pub async fn aborted(&self) {
        let mut rx = self.start.subscribe();
        let _ = rx.wait_for(|signal| *signal == StartSignal::Aborted).await;
    }

    pub async fn interrupted(&self) {
        self.interrupt.cancelled().await;
    }

    /// Wait for the daemon's DISCONNECTED acknowledgement. `false` on
    /// timeout.
    pub async fn wait_disconnect_ack(&self, limit: Duration) -> bool {
        let mut rx = self.disconnect_ack.subscribe();
        let acked = matches!(
            tokio::time::timeout(limit, rx.wait_for(|acked| *acked)).await,
            Ok(Ok(_))
        );
        acked
    }

    /// Transport listener feeding inbound envelopes into this gate.
    pub fn listener(self: &Arc<Self>) -> Arc<dyn MessageListener> {
        Arc::new(GateListener { gate: self.clone() })
    }
}

struct GateListener {
    gate: Arc<StartGate>,
}

impl MessageListener for GateListener {
    fn on_message(&self, _connection: &Arc<Connection>, envelope: &Envelope) {
        self.gate.on_envelope(envelope);
    }

    fn on_disconnect(&self, _connection: &Arc<Connection>) {
        if self.gate.abort() {
            warn!(
                process_id = self.gate.ids.process_id,
                "Lost connection to daemon; aborting"
            );
        }
    }
}
