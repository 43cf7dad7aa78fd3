//! Wire envelope and payload types.
//!
//! An [`Envelope`] is the only application-level unit carried by a
//! connection: a message type plus an opaque JSON payload whose shape is
//! implied by the type.

use std::cmp::Ordering;
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::profile::ProcessConfig;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("expected {expected} envelope, got {actual}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("malformed {msg_type} payload: {source}")]
    Payload {
        msg_type: MessageType,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed artifact encoding: {0}")]
    Artifact(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Connect,
    Ready,
    Start,
    Abort,
    Config,
    Jar,
    Status,
    Error,
    Disconnected,
    Shutdown,
    ClientCount,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Connect => "CONNECT",
            MessageType::Ready => "READY",
            MessageType::Start => "START",
            MessageType::Abort => "ABORT",
            MessageType::Config => "CONFIG",
            MessageType::Jar => "JAR",
            MessageType::Status => "STATUS",
            MessageType::Error => "ERROR",
            MessageType::Disconnected => "DISCONNECTED",
            MessageType::Shutdown => "SHUTDOWN",
            MessageType::ClientCount => "CLIENT_COUNT",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable tagged message. Fields are private so an envelope cannot be
/// altered once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    msg_type: MessageType,
    #[serde(default)]
    content: Value,
}

impl Envelope {
    pub fn new(msg_type: MessageType, content: Value) -> Self {
        Self { msg_type, content }
    }

    /// Envelope without payload (START, ABORT, SHUTDOWN, ...).
    pub fn signal(msg_type: MessageType) -> Self {
        Self::new(msg_type, Value::Null)
    }

    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, MessageError> {
        let content = serde_json::to_value(payload)
            .map_err(|source| MessageError::Payload { msg_type, source })?;
        Ok(Self::new(msg_type, content))
    }

    pub fn config(config: &ProcessConfig) -> Result<Self, MessageError> {
        Self::with_payload(MessageType::Config, config)
    }

    pub fn ready(ids: ProcessIds) -> Result<Self, MessageError> {
        Self::with_payload(MessageType::Ready, &ids)
    }

    pub fn disconnected(ids: ProcessIds) -> Result<Self, MessageError> {
        Self::with_payload(MessageType::Disconnected, &ids)
    }

    pub fn status(report: &StatusReport) -> Result<Self, MessageError> {
        Self::with_payload(MessageType::Status, report)
    }

    pub fn error(report: &StatusReport) -> Result<Self, MessageError> {
        Self::with_payload(MessageType::Error, report)
    }

    pub fn client_count(count: usize) -> Result<Self, MessageError> {
        Self::with_payload(MessageType::ClientCount, &ClientCount { count })
    }

    /// Binary artifact, base64 encoded so it survives the JSON framing.
    pub fn jar(bytes: &[u8]) -> Self {
        Self::new(
            MessageType::Jar,
            Value::String(general_purpose::STANDARD.encode(bytes)),
        )
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn is(&self, msg_type: MessageType) -> bool {
        self.msg_type == msg_type
    }

    /// Decode the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        T::deserialize(&self.content).map_err(|source| MessageError::Payload {
            msg_type: self.msg_type,
            source,
        })
    }

    /// Decode the payload after checking the envelope type.
    pub fn decode_as<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, MessageError> {
        if self.msg_type != expected {
            return Err(MessageError::UnexpectedType {
                expected,
                actual: self.msg_type,
            });
        }
        self.decode()
    }

    pub fn jar_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let encoded: String = self.decode_as(MessageType::Jar)?;
        Ok(general_purpose::STANDARD.decode(encoded.as_bytes())?)
    }
}

/// Identity pair of a test process, carried by READY and DISCONNECTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIds {
    pub process_id: u32,
    pub daemon_id: u32,
}

impl ProcessIds {
    pub fn new(process_id: u32, daemon_id: u32) -> Self {
        Self {
            process_id,
            daemon_id,
        }
    }
}

impl fmt::Display for ProcessIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process {} on daemon {}", self.process_id, self.daemon_id)
    }
}

impl PartialOrd for ProcessIds {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcessIds {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.daemon_id, self.process_id).cmp(&(other.daemon_id, other.process_id))
    }
}

/// Final outcome of a test process. Set exactly once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessOutcome {
    Successful,
    Error,
    Interrupted,
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Successful => "SUCCESSFUL",
            ProcessOutcome::Error => "ERROR",
            ProcessOutcome::Interrupted => "INTERRUPTED",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Successful)
    }
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of STATUS and ERROR envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub process_id: u32,
    pub daemon_id: u32,
    #[serde(default)]
    pub outcome: Option<ProcessOutcome>,
    pub message: String,
    pub reported_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(ids: ProcessIds, message: impl Into<String>) -> Self {
        Self {
            process_id: ids.process_id,
            daemon_id: ids.daemon_id,
            outcome: None,
            message: message.into(),
            reported_at: Utc::now(),
        }
    }

    pub fn with_outcome(mut self, outcome: ProcessOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn ids(&self) -> ProcessIds {
        ProcessIds::new(self.process_id, self.daemon_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCount {
    pub count: usize,
}
