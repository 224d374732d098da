//! The three ways of reaching the model backend, behind one contract.

pub mod adapter;
pub mod ingress;
pub mod local;
pub mod relay;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::ChatRequest;
use crate::core::error::TransportError;

pub use adapter::{StreamGuard, TransportAdapter, TransportEvent};
pub use ingress::IngressTransport;
pub use local::LocalTransport;
pub use relay::RelayTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportId {
    Local,
    Relay,
    Ingress,
}

impl TransportId {
    pub const ALL: [TransportId; 3] = [TransportId::Local, TransportId::Relay, TransportId::Ingress];

    pub fn as_str(self) -> &'static str {
        match self {
            TransportId::Local => "local",
            TransportId::Relay => "relay",
            TransportId::Ingress => "ingress",
        }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(TransportId::Local),
            "relay" | "cloud" => Ok(TransportId::Relay),
            "ingress" => Ok(TransportId::Ingress),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Lifecycle of one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Streaming)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Streaming => "streaming",
            LinkState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Result of the most recent attempt or probe. Replaced wholesale.
#[derive(Debug, Clone, Default)]
pub struct TransportStatus {
    pub connected: bool,
    pub endpoint: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub latency: Option<Duration>,
    pub error: Option<TransportError>,
}

/// Everything callers may read about one adapter, captured at once.
#[derive(Debug, Clone)]
pub struct TransportSnapshot {
    pub id: TransportId,
    pub state: LinkState,
    pub status: TransportStatus,
    pub supported: bool,
    pub active_streams: usize,
    pub retry_attempt: u32,
    pub circuit_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub endpoint: String,
    pub version: Option<String>,
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Lets a transport report that an established link died on its own, for
/// example when the relay socket closes.
#[derive(Clone)]
pub struct LinkReporter {
    tx: mpsc::UnboundedSender<TransportError>,
}

impl LinkReporter {
    pub fn new(tx: mpsc::UnboundedSender<TransportError>) -> Self {
        Self { tx }
    }

    pub fn report(&self, err: TransportError) {
        let _ = self.tx.send(err);
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// `Err(reason)` when this transport cannot work on the current
    /// platform. Resolved once at construction.
    fn supported(&self) -> Result<(), String> {
        Ok(())
    }

    fn attach(&self, _reporter: LinkReporter) {}

    /// Establishes the link. Called again after any failure, so it must
    /// replace whatever a previous attempt left behind.
    async fn connect(&self) -> Result<ProbeOutcome, TransportError>;

    /// How long one `connect` may take before the adapter gives up on it.
    /// Transports whose connect spans several bounded steps widen `default`.
    fn connect_deadline(&self, default: Duration) -> Duration {
        default
    }

    /// Checks that an established link still works.
    async fn probe(&self) -> Result<ProbeOutcome, TransportError>;

    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, TransportError>;

    /// One non-streaming call to a backend path such as `/api/tags`.
    /// Returns the body of a 2xx response.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<String, TransportError>;

    /// Tears the link down. Must be idempotent.
    async fn disconnect(&self);
}

/// Response bodies as a stream of transport results.
pub(crate) fn response_stream(response: reqwest::Response, read_timeout: Duration) -> ByteStream {
    use futures_util::StreamExt;

    response
        .bytes_stream()
        .map(move |chunk| {
            chunk.map_err(|err| TransportError::from_reqwest(err, "stream read", read_timeout))
        })
        .boxed()
}

/// Sends a streaming chat request and checks the status line.
pub(crate) async fn post_chat(
    request: reqwest::RequestBuilder,
    body: &ChatRequest,
    connect_timeout: Duration,
) -> Result<ByteStream, TransportError> {
    let response = tokio::time::timeout(connect_timeout, request.json(body).send())
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "chat request",
            after: connect_timeout,
        })?
        .map_err(|err| TransportError::from_reqwest(err, "chat request", connect_timeout))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Http {
            status: status.as_u16(),
            body,
        });
    }

    Ok(response_stream(response, connect_timeout))
}

/// Sends a proxied request and returns the body of a 2xx response.
pub(crate) async fn send_proxied(
    request: reqwest::RequestBuilder,
    body: Option<&Value>,
    timeout: Duration,
) -> Result<String, TransportError> {
    let request = match body {
        Some(body) => request.json(body),
        None => request,
    };
    let response = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|err| TransportError::from_reqwest(err, "proxied request", timeout))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| TransportError::from_reqwest(err, "proxied request", timeout))?;
    if !status.is_success() {
        return Err(TransportError::Http {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_ids_parse_and_display() {
        for id in TransportId::ALL {
            assert_eq!(id.to_string().parse::<TransportId>(), Ok(id));
        }
        assert_eq!("Cloud".parse::<TransportId>(), Ok(TransportId::Relay));
        assert!("pigeon".parse::<TransportId>().is_err());
    }

    #[test]
    fn only_connected_and_streaming_count_as_connected() {
        assert!(LinkState::Connected.is_connected());
        assert!(LinkState::Streaming.is_connected());
        assert!(!LinkState::Connecting.is_connected());
        assert!(!LinkState::Error.is_connected());
        assert!(!LinkState::Disconnected.is_connected());
    }
}
