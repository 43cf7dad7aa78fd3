use std::io;

use thiserror::Error;

/// Why a connection's handshake did not succeed. Each connection resolves
/// to at most one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("echoed handshake token does not match")]
    TokenMismatch,
    #[error("handshake token signature is invalid")]
    InvalidSignature,
    #[error("handshake key rejected")]
    InvalidKey,
    #[error("client '{0}' is already connected")]
    DuplicateClient(String),
    #[error("connection closed before the handshake completed")]
    ConnectionClosed,
    #[error("application message received before the handshake completed")]
    UnexpectedMessage,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport is already connected")]
    AlreadyConnected,
    #[error("transport is already bound")]
    AlreadyBound,
    #[error("transport is not connected")]
    NotConnected,
    #[error("connection is closed")]
    Closed,
    #[error("no live connection for client '{0}'")]
    UnknownClient(String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Encode(err.to_string())
    }
}
