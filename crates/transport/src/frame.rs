use fleetload_common::Envelope;
use serde::{Deserialize, Serialize};

use crate::handshake::HandshakeToken;

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Handshake { token: HandshakeToken },
    Message { envelope: Envelope },
}

impl Frame {
    pub fn encode_line(&self) -> Result<String, serde_json::Error> {
        Ok(serde_json::to_string(self)? + "\n")
    }

    pub fn decode_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetload_common::MessageType;
    use serde_json::json;

    #[test]
    fn message_frame_is_tagged_by_kind() {
        let frame = Frame::Message {
            envelope: Envelope::signal(MessageType::Start),
        };
        let line = frame.encode_line().unwrap();
        assert!(line.ends_with('\n'));
        let wire: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(
            wire,
            json!({"kind": "message", "envelope": {"type": "START", "content": null}})
        );
        assert_eq!(Frame::decode_line(&line).unwrap(), frame);
    }

    #[test]
    fn handshake_frame_carries_token_fields() {
        let raw = r#"{"kind":"handshake",
            "token":{"client_id":"testproc1","nonce":"n","signature":"s"}}"#;
        match Frame::decode_line(raw).unwrap() {
            Frame::Handshake { token } => assert_eq!(token.client_id, "testproc1"),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
