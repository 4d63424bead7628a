pub mod framing;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ControlError;

/// Messages carried over the control plane (one JSON object per WebSocket message).
///
/// ```text
/// { "type": "register", "payload": { "host": string|null, "port": integer } }
/// { "type": "command",  "payload": { "raw": string, ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Viewer announces where frames should be sent
    Register(Registration),
    /// Opaque instruction for the source machine
    Command(Command),
}

/// Payload of a `register` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Omitted, null or blank: the server uses the peer address of the connection
    #[serde(default)]
    pub host: Option<String>,
    pub port: u16,
}

/// Payload of a `command` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub raw: String,
    /// Extension fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ControlMessage {
    /// Registration with the host left for the server to infer.
    pub fn register(port: u16) -> Self {
        ControlMessage::Register(Registration { host: None, port })
    }

    pub fn command(raw: impl Into<String>) -> Self {
        ControlMessage::Command(Command {
            raw: raw.into(),
            extra: Map::new(),
        })
    }

    /// Parse one wire message. Unknown kinds and bad payloads are rejected.
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let mut message: ControlMessage = serde_json::from_str(text)?;
        if let ControlMessage::Register(ref mut reg) = message {
            if reg.port == 0 {
                return Err(ControlError::Malformed("register port must be non-zero".into()));
            }
            // A blank host counts as absent: the peer address is used.
            if reg.host.as_deref().is_some_and(|h| h.trim().is_empty()) {
                reg.host = None;
            }
        }
        Ok(message)
    }

    /// Parse a binary WebSocket message carrying UTF-8 JSON.
    pub fn parse_bytes(data: &[u8]) -> Result<Self, ControlError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| ControlError::Malformed(format!("not utf-8: {e}")))?;
        Self::parse(text)
    }

    pub fn to_json(&self) -> Result<String, ControlError> {
        Ok(serde_json::to_string(self)?)
    }
}
