use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::HandshakeError;

type HmacSha256 = Hmac<Sha256>;

/// Identity presented by the initiating side of a connection.
///
/// The acceptor echoes the token back unchanged; the initiator compares the
/// echo with its own token by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeToken {
    pub client_id: String,
    pub nonce: String,
    pub signature: String,
}

impl HandshakeToken {
    pub fn sign(client_id: impl Into<String>, secret: &str) -> Result<Self, HandshakeError> {
        let client_id = client_id.into();
        let nonce = Uuid::new_v4().to_string();
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| HandshakeError::InvalidKey)?;
        mac.update(canonical_body(&client_id, &nonce).as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        Ok(Self {
            client_id,
            nonce,
            signature,
        })
    }

    pub fn verify(&self, secret: &str) -> bool {
        let Ok(provided) = general_purpose::STANDARD.decode(self.signature.as_bytes()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(canonical_body(&self.client_id, &self.nonce).as_bytes());
        mac.verify_slice(&provided).is_ok()
    }
}

fn canonical_body(client_id: &str, nonce: &str) -> String {
    format!("{}|{}", client_id, nonce)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    Pending,
    Succeeded,
    Failed(HandshakeError),
}

impl HandshakeStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, HandshakeStatus::Pending)
    }
}

/// One-shot resolution of a connection's handshake.
///
/// `succeed` and `fail` return `true` only for the call that actually
/// resolved the handshake; every later call is a no-op.
#[derive(Debug)]
pub struct HandshakeState {
    status: watch::Sender<HandshakeStatus>,
}

impl Default for HandshakeState {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeState {
    pub fn new() -> Self {
        let (status, _) = watch::channel(HandshakeStatus::Pending);
        Self { status }
    }

    pub fn succeed(&self) -> bool {
        self.resolve(HandshakeStatus::Succeeded)
    }

    pub fn fail(&self, err: HandshakeError) -> bool {
        self.resolve(HandshakeStatus::Failed(err))
    }

    /// Force a timeout failure if nothing resolved the handshake yet.
    pub fn check_timeout(&self) -> bool {
        self.fail(HandshakeError::Timeout)
    }

    pub fn status(&self) -> HandshakeStatus {
        self.status.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.status.borrow().is_resolved()
    }

    /// Wait until the handshake has resolved either way.
    pub async fn resolved(&self) -> HandshakeStatus {
        let mut rx = self.status.subscribe();
        let resolved = match rx.wait_for(HandshakeStatus::is_resolved).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        };
        resolved
    }

    fn resolve(&self, outcome: HandshakeStatus) -> bool {
        self.status.send_if_modified(|current| {
            if current.is_resolved() {
                false
            } else {
                *current = outcome;
                true
            }
        })
    }
}
