use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::core::bridge::message::{decode, BridgeMessage};
use crate::core::bridge::pending::PendingRequests;
use crate::core::error::TransportError;
use crate::utils::url::construct_api_url;

/// Request headers never forwarded to the backend.
const HOP_BY_HOP_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Runs a bridged HTTP request somewhere and returns its response.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: &str,
    ) -> Result<ExecutedResponse, TransportError>;
}

/// Forwards bridged requests to the local model backend.
pub struct LocalBackendExecutor {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl LocalBackendExecutor {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RequestExecutor for LocalBackendExecutor {
    async fn execute(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: &str,
    ) -> Result<ExecutedResponse, TransportError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| TransportError::Protocol(format!("invalid method {method:?}")))?;

        let mut request = self
            .client
            .request(method, construct_api_url(&self.base_url, path))
            .timeout(self.timeout);
        for (name, value) in headers {
            if HOP_BY_HOP_HEADERS
                .iter()
                .any(|hop| name.eq_ignore_ascii_case(hop))
            {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            request = request.body(body.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransportError::from_reqwest(err, "bridged request", self.timeout))?;

        let status_code = response.status().as_u16();
        let mut response_headers = HashMap::new();
        for name in response.headers().keys() {
            if let Some(value) = response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
            {
                response_headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::from_reqwest(err, "bridged response", self.timeout))?;

        Ok(ExecutedResponse {
            status_code,
            headers: response_headers,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

/// One side of a bridge socket: answers pings and inbound requests, and
/// correlates replies to messages it originated.
///
/// The endpoint never touches the socket itself; everything it wants to send
/// goes through the outbound channel drained by the socket writer.
#[derive(Clone)]
pub struct BridgeEndpoint {
    executor: Arc<dyn RequestExecutor>,
    pending: PendingRequests,
    outbound: mpsc::Sender<BridgeMessage>,
    session_id: Arc<Mutex<Option<String>>>,
}

impl BridgeEndpoint {
    pub fn new(executor: Arc<dyn RequestExecutor>, outbound: mpsc::Sender<BridgeMessage>) -> Self {
        Self {
            executor,
            pending: PendingRequests::new(),
            outbound,
            session_id: Arc::new(Mutex::new(None)),
        }
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    /// Handles one inbound text frame.
    ///
    /// Undecodable frames are logged and skipped. The only error returned is
    /// a rejected `Auth`, which means the link must be torn down.
    pub async fn handle_frame(&self, text: &str) -> Result<(), TransportError> {
        match decode(text) {
            Ok(Some(message)) => self.handle_message(message).await,
            Ok(None) => Ok(()),
            Err(err) => {
                warn!(error = %err, "Skipping undecodable bridge frame");
                Ok(())
            }
        }
    }

    pub async fn handle_message(&self, message: BridgeMessage) -> Result<(), TransportError> {
        match message {
            BridgeMessage::Ping { id } => {
                debug!(ping_id = %id, "Answering bridge ping");
                self.send(BridgeMessage::pong_for(&id)).await
            }
            BridgeMessage::Request {
                id,
                method,
                path,
                headers,
                body,
            } => {
                let executor = Arc::clone(&self.executor);
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let reply = serve_request(executor.as_ref(), id, method, path, headers, body).await;
                    if outbound.send(reply).await.is_err() {
                        debug!("Bridge closed before response could be sent");
                    }
                });
                Ok(())
            }
            BridgeMessage::Auth {
                success,
                session_id,
            } => {
                if !success {
                    return Err(TransportError::Authentication(
                        "relay rejected the bridge token".to_string(),
                    ));
                }
                info!(session_id = ?session_id, "Bridge session authenticated");
                *self.session_id.lock().await = session_id;
                Ok(())
            }
            reply @ (BridgeMessage::Pong { .. }
            | BridgeMessage::Response { .. }
            | BridgeMessage::Error { .. }) => {
                self.pending.complete(reply).await;
                Ok(())
            }
        }
    }

    /// Sends a request across the bridge and waits for the matching response.
    #[cfg(test)]
    pub(crate) async fn send_request(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: &str,
        timeout: Duration,
    ) -> Result<ExecutedResponse, TransportError> {
        let message = BridgeMessage::request(method, path, headers, body);
        let BridgeMessage::Request { id, .. } = &message else {
            return Err(TransportError::Protocol("request builder".to_string()));
        };
        let id = id.clone();

        let rx = self.pending.register(&id).await;
        if let Err(err) = self.send(message).await {
            self.pending.cancel(&id).await;
            return Err(err);
        }

        match self.pending.wait(&id, rx, "bridge request", timeout).await? {
            BridgeMessage::Response {
                status_code,
                headers,
                body,
                ..
            } => Ok(ExecutedResponse {
                status_code,
                headers,
                body,
            }),
            other => Err(TransportError::Protocol(format!(
                "expected response, got {}",
                other.kind()
            ))),
        }
    }

    /// Sends a keep-alive ping and returns the round-trip time.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, TransportError> {
        let message = BridgeMessage::ping();
        let BridgeMessage::Ping { id } = &message else {
            return Err(TransportError::Protocol("ping builder".to_string()));
        };
        let id = id.clone();
        let started = Instant::now();

        let rx = self.pending.register(&id).await;
        if let Err(err) = self.send(message).await {
            self.pending.cancel(&id).await;
            return Err(err);
        }
        self.pending.wait(&id, rx, "keep-alive pong", timeout).await?;
        Ok(started.elapsed())
    }

    /// Fails every outstanding waiter. Called once the socket is gone.
    pub async fn close(&self) {
        let failed = self.pending.fail_all(TransportError::Closed).await;
        if failed > 0 {
            debug!(failed, "Failed pending bridge requests on close");
        }
    }

    async fn send(&self, message: BridgeMessage) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

async fn serve_request(
    executor: &dyn RequestExecutor,
    id: String,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
) -> BridgeMessage {
    debug!(request_id = %id, method = %method, path = %path, "Serving bridged request");
    match executor.execute(&method, &path, &headers, &body).await {
        Ok(response) => BridgeMessage::Response {
            id,
            status_code: response.status_code,
            headers: response.headers,
            body: response.body,
        },
        Err(err) => {
            warn!(request_id = %id, error = %err, "Bridged request failed");
            BridgeMessage::bad_gateway(&id, &err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{test_client, FakeBackend, FakeResponse};

    struct EchoExecutor;

    #[async_trait]
    impl RequestExecutor for EchoExecutor {
        async fn execute(
            &self,
            method: &str,
            path: &str,
            _headers: &HashMap<String, String>,
            body: &str,
        ) -> Result<ExecutedResponse, TransportError> {
            if path == "/fail" {
                return Err(TransportError::Connectivity("connection refused".to_string()));
            }
            Ok(ExecutedResponse {
                status_code: 200,
                headers: HashMap::new(),
                body: format!("{method} {path} {body}"),
            })
        }
    }

    fn endpoint() -> (BridgeEndpoint, mpsc::Receiver<BridgeMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (BridgeEndpoint::new(Arc::new(EchoExecutor), tx), rx)
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (endpoint, mut rx) = endpoint();
        endpoint
            .handle_frame(r#"{"type":"ping","id":"p-1"}"#)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            BridgeMessage::Pong { id, ref_id } => {
                assert_eq!(ref_id, "p-1");
                assert_ne!(id, "p-1");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_request_gets_exactly_one_response_with_same_id() {
        let (endpoint, mut rx) = endpoint();
        endpoint
            .handle_frame(
                r#"{"type":"request","id":"r-7","method":"POST","path":"/api/show","body":"{}"}"#,
            )
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            BridgeMessage::Response {
                id,
                status_code,
                body,
                ..
            } => {
                assert_eq!(id, "r-7");
                assert_eq!(status_code, 200);
                assert_eq!(body, "POST /api/show {}");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_execution_becomes_bad_gateway() {
        let (endpoint, mut rx) = endpoint();
        endpoint
            .handle_frame(r#"{"type":"request","id":"r-8","method":"GET","path":"/fail"}"#)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            BridgeMessage::Response {
                id,
                status_code,
                body,
                ..
            } => {
                assert_eq!(id, "r-8");
                assert_eq!(status_code, 502);
                assert!(body.contains("connection refused"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_response_does_not_disturb_pending_request() {
        let (endpoint, mut rx) = endpoint();
        let requester = endpoint.clone();
        let call = tokio::spawn(async move {
            requester
                .send_request("GET", "/api/tags", HashMap::new(), "", Duration::from_secs(2))
                .await
        });

        let sent_id = match rx.recv().await.unwrap() {
            BridgeMessage::Request { id, .. } => id,
            other => panic!("unexpected outbound: {other:?}"),
        };

        endpoint
            .handle_frame(r#"{"type":"response","id":"stranger","statusCode":500}"#)
            .await
            .unwrap();
        assert_eq!(endpoint.pending().len().await, 1);

        let reply = serde_json::json!({
            "type": "response",
            "id": sent_id,
            "statusCode": 200,
            "body": "ok"
        });
        endpoint.handle_frame(&reply.to_string()).await.unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "ok");
    }

    #[tokio::test]
    async fn rejected_auth_is_an_authentication_error() {
        let (endpoint, _rx) = endpoint();
        let err = endpoint
            .handle_frame(r#"{"type":"auth","success":false}"#)
            .await
            .unwrap_err();
        assert!(err.is_authentication());

        endpoint
            .handle_frame(r#"{"type":"auth","success":true,"sessionId":"s-9"}"#)
            .await
            .unwrap();
        assert_eq!(endpoint.session_id().await.as_deref(), Some("s-9"));
    }

    #[tokio::test]
    async fn garbage_and_unknown_frames_are_skipped() {
        let (endpoint, mut rx) = endpoint();
        endpoint.handle_frame("{{{").await.unwrap();
        endpoint
            .handle_frame(r#"{"type":"metrics","id":"m"}"#)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_fails_outstanding_pings() {
        let (endpoint, _rx) = endpoint();
        let pinger = endpoint.clone();
        let ping = tokio::spawn(async move { pinger.ping(Duration::from_secs(5)).await });

        while endpoint.pending().len().await == 0 {
            tokio::task::yield_now().await;
        }
        endpoint.close().await;

        assert!(matches!(ping.await.unwrap(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn local_executor_strips_hop_headers_and_keeps_first_value() {
        let backend = FakeBackend::start(|_| FakeResponse::json(201, r#"{"status":"ok"}"#)).await;
        let executor = LocalBackendExecutor::new(
            test_client(),
            backend.base_url(),
            Duration::from_secs(2),
        );
        let mut headers = HashMap::new();
        headers.insert("Host".to_string(), "relay.example.com".to_string());
        headers.insert("Connection".to_string(), "upgrade".to_string());
        headers.insert("X-Trace".to_string(), "abc".to_string());

        let response = executor
            .execute("POST", "/api/pull", &headers, r#"{"name":"llama3"}"#)
            .await
            .unwrap();

        assert_eq!(response.status_code, 201);
        assert_eq!(response.body, r#"{"status":"ok"}"#);
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );

        let recorded = &backend.requests().await[0];
        assert_eq!(recorded.method, "POST");
        assert_eq!(recorded.path, "/api/pull");
        assert_eq!(recorded.header("x-trace"), Some("abc"));
        assert_ne!(recorded.header("host"), Some("relay.example.com"));
        assert_eq!(recorded.body_json()["name"], "llama3");
    }
}
