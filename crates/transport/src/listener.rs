use std::sync::Arc;

use arc_swap::ArcSwap;
use fleetload_common::Envelope;

use crate::connection::Connection;

/// Receives inbound envelopes on the connection's reader task.
///
/// Handlers must not block: hand heavier work off to another task.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, connection: &Arc<Connection>, envelope: &Envelope);

    /// Called once when an established connection closes.
    fn on_disconnect(&self, _connection: &Arc<Connection>) {}
}

struct FnListener<F>(F);

impl<F> MessageListener for FnListener<F>
where
    F: Fn(&Arc<Connection>, &Envelope) + Send + Sync,
{
    fn on_message(&self, connection: &Arc<Connection>, envelope: &Envelope) {
        (self.0)(connection, envelope)
    }
}

/// Wrap a closure as a listener.
pub fn listener_fn<F>(f: F) -> Arc<dyn MessageListener>
where
    F: Fn(&Arc<Connection>, &Envelope) + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

/// Copy-on-write listener list.
///
/// Dispatch iterates a snapshot, so listeners may be added or removed from
/// inside a handler; the change applies from the next envelope on.
pub struct ListenerRegistry {
    listeners: ArcSwap<Vec<Arc<dyn MessageListener>>>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.rcu(|current| {
            let mut next: Vec<Arc<dyn MessageListener>> = current.iter().cloned().collect();
            next.push(listener.clone());
            next
        });
    }

    /// Remove a previously added listener, matched by identity.
    pub fn remove(&self, listener: &Arc<dyn MessageListener>) -> bool {
        let previous = self.listeners.rcu(|current| {
            current
                .iter()
                .filter(|existing| !same_listener(existing, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|existing| same_listener(existing, listener))
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn dispatch(&self, connection: &Arc<Connection>, envelope: &Envelope) {
        let snapshot = self.listeners.load_full();
        for listener in snapshot.iter() {
            listener.on_message(connection, envelope);
        }
    }

    pub(crate) fn dispatch_disconnect(&self, connection: &Arc<Connection>) {
        let snapshot = self.listeners.load_full();
        for listener in snapshot.iter() {
            listener.on_disconnect(connection);
        }
    }
}

fn same_listener(a: &Arc<dyn MessageListener>, b: &Arc<dyn MessageListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
