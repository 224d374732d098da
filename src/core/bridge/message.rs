use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::TransportError;

/// Envelope carried in every text frame of the relay bridge socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BridgeMessage {
    Auth {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Ping {
        id: String,
    },
    Pong {
        id: String,
        ref_id: String,
    },
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: String,
    },
    Response {
        id: String,
        status_code: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: String,
    },
    Error {
        id: String,
        message: String,
    },
}

const KNOWN_TYPES: &[&str] = &["auth", "ping", "pong", "request", "response", "error"];

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl BridgeMessage {
    pub fn ping() -> Self {
        BridgeMessage::Ping {
            id: new_message_id(),
        }
    }

    pub fn pong_for(ping_id: &str) -> Self {
        BridgeMessage::Pong {
            id: new_message_id(),
            ref_id: ping_id.to_string(),
        }
    }

    pub fn request(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HashMap<String, String>,
        body: impl Into<String>,
    ) -> Self {
        BridgeMessage::Request {
            id: new_message_id(),
            method: method.into(),
            path: path.into(),
            headers,
            body: body.into(),
        }
    }

    /// A `502` response carrying `{"error": message}`.
    pub fn bad_gateway(request_id: &str, message: &str) -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        BridgeMessage::Response {
            id: request_id.to_string(),
            status_code: 502,
            headers,
            body: serde_json::json!({ "error": message }).to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::Auth { .. } => "auth",
            BridgeMessage::Ping { .. } => "ping",
            BridgeMessage::Pong { .. } => "pong",
            BridgeMessage::Request { .. } => "request",
            BridgeMessage::Response { .. } => "response",
            BridgeMessage::Error { .. } => "error",
        }
    }

    /// The id a waiter would be registered under, if any. Pongs correlate
    /// through `refId`.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            BridgeMessage::Pong { ref_id, .. } => Some(ref_id.as_str()),
            BridgeMessage::Response { id, .. } | BridgeMessage::Error { id, .. } => {
                Some(id.as_str())
            }
            _ => None,
        }
    }
}

pub fn encode(message: &BridgeMessage) -> Result<String, TransportError> {
    serde_json::to_string(message)
        .map_err(|err| TransportError::Protocol(format!("failed to encode bridge message: {err}")))
}

/// Decodes one text frame.
///
/// Returns `Ok(None)` for well-formed frames with an unrecognised `type`;
/// those are logged and ignored. Anything else that fails to parse is a
/// protocol error for that frame only.
pub fn decode(text: &str) -> Result<Option<BridgeMessage>, TransportError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|err| TransportError::Protocol(format!("invalid bridge frame: {err}")))?;

    let Some(kind) = value
        .get("type")
        .and_then(|kind| kind.as_str())
        .map(str::to_owned)
    else {
        return Err(TransportError::Protocol(
            "bridge frame is missing a type".to_string(),
        ));
    };

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        warn!(message_type = %kind, "Ignoring unknown bridge message type");
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|err| TransportError::Protocol(format!("malformed {kind} message: {err}")))
}
