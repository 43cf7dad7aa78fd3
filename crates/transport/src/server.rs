use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use fleetload_common::Envelope;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::connection::{Connection, Role, SendHandle};
use crate::error::TransportError;
use crate::listener::{ListenerRegistry, MessageListener};
use crate::registry::ConnectionRegistry;
use crate::TransportConfig;

type Accepted = Arc<Mutex<Vec<Weak<Connection>>>>;

/// Accepting side: listens for peers and tracks them by client id.
pub struct TransportServer {
    bind_addr: String,
    secret: Arc<str>,
    config: TransportConfig,
    listeners: Arc<ListenerRegistry>,
    registry: Arc<ConnectionRegistry>,
    accepted: Accepted,
    bound: AtomicBool,
    stopped: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportServer {
    pub fn new(
        bind_addr: impl Into<String>,
        secret: impl Into<String>,
        config: TransportConfig,
    ) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            secret: Arc::from(secret.into()),
            config,
            listeners: Arc::new(ListenerRegistry::new()),
            registry: Arc::new(ConnectionRegistry::new()),
            accepted: Arc::new(Mutex::new(Vec::new())),
            bound: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            accept_task: Mutex::new(None),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind the listening socket and start accepting. Returns the bound
    /// address, which matters when binding port 0.
    pub async fn bind(&self) -> Result<SocketAddr, TransportError> {
        if self.bound.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyBound);
        }
        let listener = match TcpListener::bind(&self.bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                self.bound.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);
        info!(address = %local, "Listening for fleet connections");

        let task = tokio::spawn(accept_loop(
            listener,
            self.secret.clone(),
            self.registry.clone(),
            self.listeners.clone(),
            self.accepted.clone(),
            self.config,
        ));
        *self.accept_task.lock() = Some(task);
        Ok(local)
    }

    pub fn send_to(&self, client_id: &str, envelope: Envelope) -> SendHandle {
        match self.registry.get(client_id) {
            Some(conn) => conn.send(envelope),
            None => SendHandle::ready(Err(TransportError::UnknownClient(client_id.to_string()))),
        }
    }

    pub fn broadcast<P>(&self, envelope: &Envelope, predicate: P) -> Vec<(String, SendHandle)>
    where
        P: Fn(&str) -> bool,
    {
        self.registry.broadcast(envelope, predicate)
    }

    /// Stop accepting and close every connection, each bounded by the
    /// disconnect timeout. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            task.abort();
        }

        let connections: Vec<Arc<Connection>> = self
            .accepted
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        let count = connections.len();

        let grace = self.config.disconnect_timeout;
        let mut closing = JoinSet::new();
        for conn in connections {
            closing.spawn(async move { conn.close(grace).await });
        }
        while closing.join_next().await.is_some() {}
        info!(closed_connections = count, "Transport server stopped");
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    secret: Arc<str>,
    registry: Arc<ConnectionRegistry>,
    listeners: Arc<ListenerRegistry>,
    accepted: Accepted,
    config: TransportConfig,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(addr = %addr, "Accepted connection");
                let conn = Connection::start(
                    stream,
                    Role::Acceptor {
                        secret: secret.clone(),
                        registry: registry.clone(),
                    },
                    listeners.clone(),
                    config,
                );
                let mut tracked = accepted.lock();
                tracked.retain(|weak| weak.upgrade().map(|c| c.is_live()).unwrap_or(false));
                tracked.push(Arc::downgrade(&conn));
            }
            Err(err) => {
                error!("Accept error: {}", err);
            }
        }
    }
}
