use std::net::SocketAddr;
use std::sync::Arc;

use fleetload_common::ids::{is_console, is_test_process};
use fleetload_common::{Envelope, MessageType};
use fleetload_transport::{
    Connection, ConnectionRegistry, MessageListener, SendHandle, TransportConfig, TransportError,
    TransportServer,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Last CONFIG and JAR a console pushed, replayed to test processes that
/// announce themselves later.
#[derive(Default)]
struct Replay {
    config: Option<Envelope>,
    jar: Option<Envelope>,
}

struct RelayState {
    daemon_id: u32,
    registry: Arc<ConnectionRegistry>,
    replay: Mutex<Replay>,
    shutdown: CancellationToken,
}

impl RelayState {
    fn to_test_processes(&self, envelope: &Envelope) -> usize {
        let sent = self.registry.broadcast(envelope, is_test_process);
        let count = sent.len();
        watch_sends(envelope.msg_type(), sent);
        count
    }

    fn to_consoles(&self, envelope: &Envelope) -> usize {
        let sent = self.registry.broadcast(envelope, is_console);
        let count = sent.len();
        watch_sends(envelope.msg_type(), sent);
        count
    }

    fn request_shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let aborted = self.to_test_processes(&Envelope::signal(MessageType::Abort));
        info!(
            daemon_id = self.daemon_id,
            aborted_processes = aborted,
            "Daemon shutdown requested"
        );
        self.shutdown.cancel();
    }

    fn from_console(&self, peer: &str, connection: &Arc<Connection>, envelope: &Envelope) {
        match envelope.msg_type() {
            MessageType::Config => {
                self.replay.lock().config = Some(envelope.clone());
                let count = self.to_test_processes(envelope);
                info!(client_id = peer, test_processes = count, "Relayed CONFIG");
            }
            MessageType::Jar => {
                self.replay.lock().jar = Some(envelope.clone());
                let count = self.to_test_processes(envelope);
                info!(client_id = peer, test_processes = count, "Relayed JAR");
            }
            MessageType::Start | MessageType::Abort => {
                let count = self.to_test_processes(envelope);
                info!(
                    client_id = peer,
                    msg_type = %envelope.msg_type(),
                    test_processes = count,
                    "Relayed control signal"
                );
            }
            MessageType::Shutdown => self.request_shutdown(),
            MessageType::ClientCount => {
                let count = self.registry.count_matching(is_test_process);
                debug!(client_id = peer, count, "Answering CLIENT_COUNT");
                match Envelope::client_count(count) {
                    Ok(reply) => watch_sends(
                        MessageType::ClientCount,
                        vec![(peer.to_string(), connection.send(reply))],
                    ),
                    Err(err) => warn!("Failed to encode CLIENT_COUNT: {}", err),
                }
            }
            other => warn!(client_id = peer, msg_type = %other, "Unexpected message from console"),
        }
    }

    fn from_test_process(&self, peer: &str, connection: &Arc<Connection>, envelope: &Envelope) {
        match envelope.msg_type() {
            MessageType::Connect => {
                let replay = {
                    let replay = self.replay.lock();
                    [replay.jar.clone(), replay.config.clone()]
                };
                for envelope in replay.into_iter().flatten() {
                    let msg_type = envelope.msg_type();
                    debug!(client_id = peer, msg_type = %msg_type, "Replaying to late joiner");
                    watch_sends(msg_type, vec![(peer.to_string(), connection.send(envelope))]);
                }
            }
            MessageType::Ready | MessageType::Status | MessageType::Error => {
                self.to_consoles(envelope);
            }
            MessageType::Disconnected => {
                debug!(client_id = peer, "Acknowledging DISCONNECTED");
                watch_sends(
                    MessageType::Disconnected,
                    vec![(peer.to_string(), connection.send(envelope.clone()))],
                );
                self.to_consoles(envelope);
            }
            other => warn!(
                client_id = peer,
                msg_type = %other,
                "Unexpected message from test process"
            ),
        }
    }
}

/// Log failed deliveries without holding up the reader that triggered them.
fn watch_sends(msg_type: MessageType, sends: Vec<(String, SendHandle)>) {
    if sends.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for (client_id, handle) in sends {
            if let Err(err) = handle.await {
                warn!(%client_id, %msg_type, "Delivery failed: {}", err);
            }
        }
    });
}

struct RelayListener {
    state: Arc<RelayState>,
}

impl MessageListener for RelayListener {
    fn on_message(&self, connection: &Arc<Connection>, envelope: &Envelope) {
        let Some(peer) = connection.peer_id() else {
            return;
        };
        if is_console(peer) {
            self.state.from_console(peer, connection, envelope);
        } else if is_test_process(peer) {
            self.state.from_test_process(peer, connection, envelope);
        } else {
            warn!(
                client_id = peer,
                msg_type = %envelope.msg_type(),
                "Message from unknown peer kind"
            );
        }
    }

    fn on_disconnect(&self, connection: &Arc<Connection>) {
        info!(
            client_id = connection.peer_id().unwrap_or("unknown"),
            remaining = self.state.registry.len(),
            "Peer disconnected"
        );
    }
}

/// The daemon's accepting transport plus its relay rules.
pub struct Relay {
    server: TransportServer,
    state: Arc<RelayState>,
}

impl Relay {
    pub fn new(
        daemon_id: u32,
        bind_addr: impl Into<String>,
        secret: impl Into<String>,
        config: TransportConfig,
    ) -> Self {
        let server = TransportServer::new(bind_addr, secret, config);
        let state = Arc::new(RelayState {
            daemon_id,
            registry: server.registry().clone(),
            replay: Mutex::new(Replay::default()),
            shutdown: CancellationToken::new(),
        });
        server.add_listener(Arc::new(RelayListener {
            state: state.clone(),
        }));
        Self { server, state }
    }

    pub fn daemon_id(&self) -> u32 {
        self.state.daemon_id
    }

    pub async fn start(&self) -> Result<SocketAddr, TransportError> {
        let addr = self.server.bind().await?;
        info!(daemon_id = self.state.daemon_id, address = %addr, "Daemon relay started");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.server.registry()
    }

    pub fn test_process_count(&self) -> usize {
        self.registry().count_matching(is_test_process)
    }

    /// Abort every test process and wake [`shutdown_requested`](Self::shutdown_requested).
    pub fn request_shutdown(&self) {
        self.state.request_shutdown();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.state.shutdown.is_cancelled()
    }

    /// Resolves once a console sent SHUTDOWN or [`request_shutdown`](Self::request_shutdown)
    /// was called.
    pub async fn shutdown_requested(&self) {
        self.state.shutdown.cancelled().await;
    }

    /// Close all connections. Idempotent.
    pub async fn stop(&self) {
        self.server.shutdown().await;
        info!(daemon_id = self.state.daemon_id, "Daemon relay stopped");
    }
}
