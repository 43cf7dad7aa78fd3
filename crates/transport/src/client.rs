use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use fleetload_common::Envelope;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::connection::{Connection, Role, SendHandle};
use crate::error::TransportError;
use crate::handshake::{HandshakeStatus, HandshakeToken};
use crate::listener::{ListenerRegistry, MessageListener};
use crate::TransportConfig;

/// Initiating side: one connection to one remote peer.
pub struct TransportClient {
    address: String,
    client_id: String,
    secret: String,
    config: TransportConfig,
    listeners: Arc<ListenerRegistry>,
    connecting: AtomicBool,
    connection: OnceLock<Arc<Connection>>,
}

impl TransportClient {
    pub fn new(
        address: impl Into<String>,
        client_id: impl Into<String>,
        secret: impl Into<String>,
        config: TransportConfig,
    ) -> Self {
        Self {
            address: address.into(),
            client_id: client_id.into(),
            secret: secret.into(),
            config,
            listeners: Arc::new(ListenerRegistry::new()),
            connecting: AtomicBool::new(false),
            connection: OnceLock::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Open the socket and start the handshake. Returns once the TCP
    /// connection is established; use [`wait_handshake`](Self::wait_handshake)
    /// to wait for the peer's echo. A second call fails with
    /// [`TransportError::AlreadyConnected`] unless the first one failed.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }

        let opened = match HandshakeToken::sign(self.client_id.clone(), &self.secret) {
            Ok(token) => TcpStream::connect(&self.address)
                .await
                .map(|stream| (token, stream))
                .map_err(TransportError::from),
            Err(err) => Err(err.into()),
        };
        let (token, stream) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                self.connecting.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        let conn = Connection::start(
            stream,
            Role::Initiator { token },
            self.listeners.clone(),
            self.config,
        );
        let _ = self.connection.set(conn);
        info!(client_id = %self.client_id, address = %self.address, "Connected");
        Ok(())
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.get()
    }

    pub fn send(&self, envelope: Envelope) -> SendHandle {
        match self.connection.get() {
            Some(conn) => conn.send(envelope),
            None => SendHandle::ready(Err(TransportError::NotConnected)),
        }
    }

    pub fn handshake_status(&self) -> Option<HandshakeStatus> {
        self.connection.get().map(|conn| conn.handshake_status())
    }

    pub async fn wait_handshake(&self) -> Result<(), TransportError> {
        match self.connection.get() {
            Some(conn) => conn.wait_handshake().await,
            None => Err(TransportError::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .get()
            .map(|conn| conn.is_live() && conn.handshake_status() == HandshakeStatus::Succeeded)
            .unwrap_or(false)
    }

    /// Flush queued writes within the configured grace period, then close.
    /// No-op when never connected or already disconnected.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.connection.get() {
            if conn.is_live() {
                debug!(client_id = %self.client_id, "Disconnecting");
            }
            conn.close(self.config.disconnect_timeout).await;
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get() {
            conn.force_close();
        }
    }
}
