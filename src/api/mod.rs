use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod models;

/// Body of `POST /api/chat`. Messages are forwarded as opaque JSON.
#[derive(Serialize, Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub stream: bool,
}

impl ChatRequest {
    /// Builds a streaming request from prior history plus a new user prompt.
    pub fn with_prompt(model: impl Into<String>, history: Vec<Value>, prompt: &str) -> Self {
        let mut messages = history;
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));
        Self {
            model: model.into(),
            messages,
            stream: true,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ChatChunkMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// One NDJSON line of a streaming chat response.
#[derive(Deserialize, Debug, Default)]
pub struct ChatChunk {
    #[serde(default)]
    pub message: Option<ChatChunkMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ChatChunk {
    pub fn content(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|message| message.content.as_deref())
            .filter(|content| !content.is_empty())
    }

    /// Flattens the backend's error field, which may be a string or an object
    /// with a `message`.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            Value::Object(map) => Some(
                map.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            ),
            other => Some(other.to_string()),
        }
    }
}

/// `GET /api/version` on the local backend, and `GET /api/health` on the relay.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct VersionResponse {
    #[serde(default)]
    pub version: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ModelTag {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelTag>,
}
