use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use fleetload_common::Envelope;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, TransportError};
use crate::frame::Frame;
use crate::handshake::{HandshakeState, HandshakeStatus, HandshakeToken};
use crate::listener::ListenerRegistry;
use crate::registry::ConnectionRegistry;
use crate::TransportConfig;

type SendResult = Result<(), TransportError>;

pub(crate) enum Role {
    Initiator {
        token: HandshakeToken,
    },
    Acceptor {
        secret: Arc<str>,
        registry: Arc<ConnectionRegistry>,
    },
}

struct Outbound {
    frame: Frame,
    done: Option<oneshot::Sender<SendResult>>,
}

impl Outbound {
    fn complete(self, result: SendResult) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }
}

enum Gate {
    /// Handshake unresolved: application frames wait here in send order.
    Pending(Vec<Outbound>),
    Open,
    Closed,
}

struct Outbox {
    gate: Gate,
    queue: Option<mpsc::UnboundedSender<Outbound>>,
}

impl Outbox {
    fn enqueue(&self, item: Outbound) {
        match &self.queue {
            Some(queue) => {
                if let Err(mpsc::error::SendError(item)) = queue.send(item) {
                    item.complete(Err(TransportError::Closed));
                }
            }
            None => item.complete(Err(TransportError::Closed)),
        }
    }
}

/// One persistent peer connection.
///
/// Writes go through an unbounded queue drained by a writer task, so `send`
/// never blocks. Until the handshake succeeds, application envelopes are
/// held back and flushed in order the moment it does.
pub struct Connection {
    role: Role,
    peer_id: OnceLock<String>,
    peer_addr: Option<SocketAddr>,
    outbox: Mutex<Outbox>,
    handshake: HandshakeState,
    closed: AtomicBool,
    listeners: Arc<ListenerRegistry>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn start(
        stream: TcpStream,
        role: Role,
        listeners: Arc<ListenerRegistry>,
        config: TransportConfig,
    ) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();
        if let Err(err) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", err);
        }
        let (read_half, write_half) = stream.into_split();
        let (queue, rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            role,
            peer_id: OnceLock::new(),
            peer_addr,
            outbox: Mutex::new(Outbox {
                gate: Gate::Pending(Vec::new()),
                queue: Some(queue),
            }),
            handshake: HandshakeState::new(),
            closed: AtomicBool::new(false),
            listeners,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        });

        let writer = tokio::spawn(write_loop(write_half, rx, conn.clone()));
        *conn.writer.lock() = Some(writer);

        if let Role::Initiator { token } = &conn.role {
            conn.enqueue_handshake(token.clone());
        }
        conn.spawn_handshake_timer(config.handshake_timeout);

        let reader = tokio::spawn(conn.clone().read_loop(read_half, config.max_frame_len));
        *conn.reader.lock() = Some(reader);
        conn
    }

    /// Client id of the remote peer. Known on the accepting side once the
    /// handshake token arrived.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.get().map(String::as_str)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn handshake_status(&self) -> HandshakeStatus {
        self.handshake.status()
    }

    pub async fn wait_handshake(&self) -> Result<(), TransportError> {
        match self.handshake.resolved().await {
            HandshakeStatus::Succeeded => Ok(()),
            HandshakeStatus::Failed(err) => Err(err.into()),
            HandshakeStatus::Pending => Err(TransportError::NotConnected),
        }
    }

    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Queue `envelope` for delivery. The returned handle resolves once the
    /// frame has been written to the socket or the connection has failed.
    pub fn send(&self, envelope: Envelope) -> SendHandle {
        let (done, rx) = oneshot::channel();
        let item = Outbound {
            frame: Frame::Message { envelope },
            done: Some(done),
        };

        let mut guard = self.outbox.lock();
        let outbox = &mut *guard;
        match &mut outbox.gate {
            Gate::Pending(buffer) => buffer.push(item),
            Gate::Open => outbox.enqueue(item),
            Gate::Closed => return SendHandle::ready(Err(TransportError::Closed)),
        }
        SendHandle::pending(rx)
    }

    /// Close gracefully: stop accepting sends, let the writer flush what is
    /// already queued for at most `grace`, then force the socket down.
    /// Calling it again is a no-op.
    pub async fn close(self: &Arc<Self>, grace: Duration) {
        self.mark_closed();

        let writer = self.writer.lock().take();
        if let Some(mut handle) = writer {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(peer = self.label(), "Writer did not drain in time; forcing close");
                handle.abort();
            }
        }

        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }
    }

    /// Log label: our own client id when initiating, the peer's when
    /// accepting.
    fn label(&self) -> &str {
        match &self.role {
            Role::Initiator { token } => token.client_id.as_str(),
            Role::Acceptor { .. } => self.peer_id().unwrap_or("unidentified"),
        }
    }

    fn enqueue_handshake(&self, token: HandshakeToken) {
        let item = Outbound {
            frame: Frame::Handshake { token },
            done: None,
        };
        self.outbox.lock().enqueue(item);
    }

    fn open_gate(&self) {
        let mut guard = self.outbox.lock();
        let outbox = &mut *guard;
        let buffered = match std::mem::replace(&mut outbox.gate, Gate::Open) {
            Gate::Pending(buffered) => buffered,
            other => {
                outbox.gate = other;
                return;
            }
        };
        if !buffered.is_empty() {
            debug!(peer = self.label(), count = buffered.len(), "Flushing buffered envelopes");
        }
        for item in buffered {
            outbox.enqueue(item);
        }
    }

    fn close_gate(&self) {
        let buffered = {
            let mut guard = self.outbox.lock();
            // Dropping the queue sender lets the writer finish what is queued.
            guard.queue = None;
            match std::mem::replace(&mut guard.gate, Gate::Closed) {
                Gate::Pending(buffered) => buffered,
                _ => Vec::new(),
            }
        };
        for item in buffered {
            item.complete(Err(TransportError::Closed));
        }
    }

    fn spawn_handshake_timer(self: &Arc<Self>, limit: Duration) {
        let conn = self.clone();
        tokio::spawn(async move {
            let waited = tokio::time::timeout(limit, conn.handshake.resolved()).await;
            if waited.is_err() && conn.handshake.check_timeout() {
                warn!(
                    peer = conn.label(),
                    timeout_ms = limit.as_millis() as u64,
                    "Handshake timed out"
                );
                conn.force_close();
            }
        });
    }

    /// Close from outside the reader task: besides [`Self::mark_closed`],
    /// stop the reader so the socket goes away even if the peer stays quiet.
    pub(crate) fn force_close(self: &Arc<Self>) {
        self.mark_closed();
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }
    }

    /// Synchronous part of closing, safe to call from any task and more than
    /// once.
    fn mark_closed(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let established = self.handshake.status() == HandshakeStatus::Succeeded;
        if self.handshake.fail(HandshakeError::ConnectionClosed) {
            debug!(peer = self.label(), "Connection dropped before handshake resolved");
        }
        self.close_gate();

        if let Role::Acceptor { registry, .. } = &self.role {
            if let Some(client_id) = self.peer_id.get() {
                registry.remove(client_id, self);
            }
        }
        if established {
            info!(peer = self.label(), "Connection closed");
            self.listeners.dispatch_disconnect(self);
        }
    }

    /// Frames are newline-delimited and at most `max_frame_len` bytes. A
    /// longer frame closes the connection; a line that is not UTF-8 or not a
    /// frame is dropped like any other malformed input.
    async fn read_loop(self: Arc<Self>, read_half: OwnedReadHalf, max_frame_len: usize) {
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_frame_len);
        let mut lines = FramedRead::new(read_half, codec);

        while let Some(next) = lines.next().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    warn!(peer = self.label(), max_frame_len, "Inbound frame too long; closing");
                    break;
                }
                Err(err) => {
                    debug!(peer = self.label(), "Read error: {}", err);
                    break;
                }
            };
            let raw = match std::str::from_utf8(&chunk) {
                Ok(raw) => raw.trim(),
                Err(err) => {
                    warn!(peer = self.label(), "Dropping frame that is not UTF-8: {}", err);
                    continue;
                }
            };
            if raw.is_empty() {
                continue;
            }
            match Frame::decode_line(raw) {
                Ok(frame) => {
                    if !self.handle_frame(frame) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(peer = self.label(), "Dropping malformed frame: {}", err);
                }
            }
        }
        self.mark_closed();
    }

    /// Returns `false` when the connection must be closed.
    fn handle_frame(self: &Arc<Self>, frame: Frame) -> bool {
        match frame {
            Frame::Handshake { token } => self.handle_handshake(token),
            Frame::Message { envelope } => match self.handshake.status() {
                HandshakeStatus::Succeeded => {
                    debug!(
                        peer = self.label(),
                        msg_type = %envelope.msg_type(),
                        "Received envelope"
                    );
                    self.listeners.dispatch(self, &envelope);
                    true
                }
                _ => {
                    if self.handshake.fail(HandshakeError::UnexpectedMessage) {
                        warn!(
                            peer = self.label(),
                            msg_type = %envelope.msg_type(),
                            "Envelope arrived before handshake; closing"
                        );
                    }
                    false
                }
            },
        }
    }

    fn handle_handshake(self: &Arc<Self>, token: HandshakeToken) -> bool {
        if self.handshake.is_resolved() {
            debug!(peer = self.label(), "Ignoring repeated handshake frame");
            return self.handshake.status() == HandshakeStatus::Succeeded;
        }

        match &self.role {
            Role::Initiator { token: own } => {
                if &token != own {
                    if self.handshake.fail(HandshakeError::TokenMismatch) {
                        warn!(
                            client_id = %own.client_id,
                            "Handshake echo does not match our token"
                        );
                    }
                    return false;
                }
                if !self.handshake.succeed() {
                    return false;
                }
                self.open_gate();
                info!(client_id = %own.client_id, "Handshake completed");
                true
            }
            Role::Acceptor { secret, registry } => {
                if !token.verify(secret) {
                    if self.handshake.fail(HandshakeError::InvalidSignature) {
                        warn!(
                            client_id = %token.client_id,
                            "Rejected handshake with invalid signature"
                        );
                    }
                    return false;
                }
                let client_id = token.client_id.clone();
                let _ = self.peer_id.set(client_id.clone());

                if let Err(err) = registry.register(&client_id, self.clone()) {
                    if self.handshake.fail(err) {
                        warn!(client_id = %client_id, "Rejected duplicate client");
                    }
                    return false;
                }

                self.enqueue_handshake(token);
                if !self.handshake.succeed() {
                    registry.remove(&client_id, self);
                    return false;
                }
                self.open_gate();
                info!(
                    client_id = %client_id,
                    addr = ?self.peer_addr,
                    "Peer registered"
                );
                true
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    conn: Arc<Connection>,
) {
    while let Some(item) = rx.recv().await {
        let line = match item.frame.encode_line() {
            Ok(line) => line,
            Err(err) => {
                warn!(peer = conn.label(), "Failed to encode frame: {}", err);
                item.complete(Err(err.into()));
                continue;
            }
        };
        match write_half.write_all(line.as_bytes()).await {
            Ok(()) => item.complete(Ok(())),
            Err(err) => {
                debug!(peer = conn.label(), "Write failed: {}", err);
                item.complete(Err(err.into()));
                rx.close();
                while let Ok(rest) = rx.try_recv() {
                    rest.complete(Err(TransportError::Closed));
                }
                conn.force_close();
                return;
            }
        }
    }
    let _ = write_half.shutdown().await;
}

enum SendState {
    Ready(Option<SendResult>),
    Pending(oneshot::Receiver<SendResult>),
}

/// Completion handle of an asynchronous send. Dropping it does not cancel
/// the write.
pub struct SendHandle {
    state: SendState,
}

impl SendHandle {
    /// A handle that is already resolved.
    pub fn ready(result: SendResult) -> Self {
        Self {
            state: SendState::Ready(Some(result)),
        }
    }

    fn pending(rx: oneshot::Receiver<SendResult>) -> Self {
        Self {
            state: SendState::Pending(rx),
        }
    }
}

impl Future for SendHandle {
    type Output = SendResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            SendState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(TransportError::Closed)))
            }
            SendState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::Closed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
