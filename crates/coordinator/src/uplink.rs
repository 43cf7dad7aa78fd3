use std::sync::Arc;

use fleetload_common::Envelope;
use fleetload_transport::{MessageListener, SendHandle, TransportClient};

/// The coordinator's view of its connection to the daemon.
pub trait Uplink: Send + Sync {
    fn send(&self, envelope: Envelope) -> SendHandle;

    fn subscribe(&self, listener: Arc<dyn MessageListener>);

    fn unsubscribe(&self, listener: &Arc<dyn MessageListener>);
}

impl Uplink for TransportClient {
    fn send(&self, envelope: Envelope) -> SendHandle {
        TransportClient::send(self, envelope)
    }

    fn subscribe(&self, listener: Arc<dyn MessageListener>) {
        self.add_listener(listener);
    }

    fn unsubscribe(&self, listener: &Arc<dyn MessageListener>) {
        self.remove_listener(listener);
    }
}
