//! Persistent, handshake-gated message transport between fleetload peers.
//!
//! A [`TransportClient`] plays the initiating role (one remote peer), a
//! [`TransportServer`] the accepting role (many peers, tracked by client id
//! in a [`ConnectionRegistry`]). Both exchange [`Envelope`]s framed as
//! newline-delimited JSON and deliver inbound traffic to registered
//! [`MessageListener`]s.
//!
//! [`Envelope`]: fleetload_common::Envelope

mod client;
mod connection;
mod error;
mod frame;
mod handshake;
mod listener;
mod registry;
mod server;

use std::time::Duration;

use fleetload_common::TransportSettings;

pub use client::TransportClient;
pub use connection::{Connection, SendHandle};
pub use error::{HandshakeError, TransportError};
pub use frame::Frame;
pub use handshake::{HandshakeState, HandshakeStatus, HandshakeToken};
pub use listener::{listener_fn, ListenerRegistry, MessageListener};
pub use registry::ConnectionRegistry;
pub use server::TransportServer;

/// Limits applied to every connection of a client or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub handshake_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&TransportSettings::default())
    }
}

impl From<&TransportSettings> for TransportConfig {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            handshake_timeout: settings.handshake_timeout(),
            disconnect_timeout: settings.disconnect_timeout(),
            max_frame_len: settings.max_frame_bytes,
        }
    }
}
