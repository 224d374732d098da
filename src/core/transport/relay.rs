//! Cloud relay transport.
//!
//! Connecting is two phases: an authenticated health check over HTTPS, then
//! the bridge WebSocket. While the socket is up the relay can push HTTP
//! requests down it; they are served against the local backend and answered
//! on the same socket. Chat streams go through the relay's HTTP proxy.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::models::get_json;
use crate::api::ChatRequest;
use crate::core::auth::Authenticator;
use crate::core::bridge::message::encode;
use crate::core::bridge::{BridgeEndpoint, BridgeMessage, LocalBackendExecutor, RequestExecutor};
use crate::core::config::Config;
use crate::core::error::TransportError;
use crate::core::transport::{
    post_chat, send_proxied, ByteStream, LinkReporter, ProbeOutcome, Transport, TransportId,
};
use crate::utils::url::{bridge_socket_url, construct_api_url, normalize_base_url, relay_proxy_path};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 64;

#[derive(Deserialize, Debug, Default)]
struct HealthResponse {
    #[serde(default)]
    version: Option<String>,
}

/// A live bridge socket and the tasks serving it.
struct BridgeLink {
    endpoint: BridgeEndpoint,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Reports a dead link at most once, and never after a deliberate teardown.
#[derive(Clone)]
struct LinkWatch {
    cancel: CancellationToken,
    reporter: Option<LinkReporter>,
}

impl LinkWatch {
    fn lost(&self, err: TransportError) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        warn!(error = %err, "Relay bridge lost");
        if let Some(reporter) = &self.reporter {
            reporter.report(err);
        }
    }
}

pub struct RelayTransport {
    client: reqwest::Client,
    base_url: String,
    auth: Arc<dyn Authenticator>,
    executor: Arc<dyn RequestExecutor>,
    keep_alive: Duration,
    pong_timeout: Duration,
    timeout: Duration,
    link: tokio::sync::Mutex<Option<BridgeLink>>,
    reporter: Mutex<Option<LinkReporter>>,
}

impl RelayTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        auth: Arc<dyn Authenticator>,
        executor: Arc<dyn RequestExecutor>,
        keep_alive: Duration,
        pong_timeout: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url),
            auth,
            executor,
            keep_alive,
            pong_timeout,
            timeout,
            link: tokio::sync::Mutex::new(None),
            reporter: Mutex::new(None),
        }
    }

    /// Bridged requests are served against the configured local backend.
    pub fn from_config(client: reqwest::Client, config: &Config, auth: Arc<dyn Authenticator>) -> Self {
        let executor = LocalBackendExecutor::new(
            client.clone(),
            config.local.base_url.clone(),
            config.local.request_timeout(),
        );
        Self::new(
            client,
            &config.relay.base_url,
            auth,
            Arc::new(executor),
            config.relay.keep_alive(),
            config.relay.pong_timeout(),
            config.connection.connection_timeout(),
        )
    }

    fn token(&self) -> Result<String, TransportError> {
        self.auth.access_token().ok_or_else(|| {
            TransportError::Authentication("no relay token available; sign in first".to_string())
        })
    }

    async fn check_health(&self, token: &str) -> Result<HealthResponse, TransportError> {
        let url = construct_api_url(&self.base_url, "api/health");
        get_json::<HealthResponse>(self.client.get(url).bearer_auth(token), "relay health", self.timeout)
            .await
            .map_err(rejected_token)
    }

    async fn open_socket(&self, token: &str) -> Result<Socket, TransportError> {
        let url = bridge_socket_url(&self.base_url, token);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Protocol(format!("invalid bridge url: {err}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| TransportError::Authentication("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _) = tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "bridge handshake",
                after: self.timeout,
            })?
            .map_err(socket_error)?;
        Ok(socket)
    }

    fn spawn_link(&self, socket: Socket) -> BridgeLink {
        let (sink, source) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let endpoint = BridgeEndpoint::new(Arc::clone(&self.executor), outbound_tx);
        let cancel = CancellationToken::new();
        let watch = LinkWatch {
            cancel: cancel.clone(),
            reporter: self
                .reporter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };

        let tasks = vec![
            tokio::spawn(write_frames(sink, outbound_rx, watch.clone())),
            tokio::spawn(read_frames(source, endpoint.clone(), watch.clone())),
            tokio::spawn(keep_alive(
                endpoint.clone(),
                self.keep_alive,
                self.pong_timeout,
                watch,
            )),
        ];

        BridgeLink {
            endpoint,
            cancel,
            tasks,
        }
    }

    async fn live_endpoint(&self) -> Option<BridgeEndpoint> {
        self.link
            .lock()
            .await
            .as_ref()
            .filter(|link| !link.cancel.is_cancelled())
            .map(|link| link.endpoint.clone())
    }

    async fn teardown(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.cancel.cancel();
            link.endpoint.close().await;
            for task in link.tasks {
                if !task.is_finished() {
                    task.abort();
                }
            }
            debug!(base_url = %self.base_url, "Relay bridge torn down");
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn id(&self) -> TransportId {
        TransportId::Relay
    }

    fn attach(&self, reporter: LinkReporter) {
        *self.reporter.lock().unwrap_or_else(PoisonError::into_inner) = Some(reporter);
    }

    async fn connect(&self) -> Result<ProbeOutcome, TransportError> {
        let token = self.token()?;
        let health = self.check_health(&token).await?;

        self.teardown().await;
        let socket = self.open_socket(&token).await?;
        let link = self.spawn_link(socket);
        *self.link.lock().await = Some(link);

        info!(base_url = %self.base_url, version = ?health.version, "Relay bridge established");
        Ok(ProbeOutcome {
            endpoint: self.base_url.clone(),
            version: health.version,
        })
    }

    /// The health check and the socket handshake are each bounded by
    /// `timeout`.
    fn connect_deadline(&self, default: Duration) -> Duration {
        default.max(self.timeout * 2)
    }

    async fn probe(&self) -> Result<ProbeOutcome, TransportError> {
        let endpoint = self
            .live_endpoint()
            .await
            .ok_or_else(|| TransportError::Protocol("bridge socket is not open".to_string()))?;
        let token = self.token()?;
        let health = self.check_health(&token).await?;
        let rtt = endpoint.ping(self.pong_timeout).await?;
        debug!(rtt_ms = rtt.as_millis() as u64, "Relay bridge ping");

        Ok(ProbeOutcome {
            endpoint: self.base_url.clone(),
            version: health.version,
        })
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, TransportError> {
        let token = self.token()?;
        let url = construct_api_url(&self.base_url, &relay_proxy_path("/api/chat"));
        post_chat(self.client.post(url).bearer_auth(token), request, self.timeout)
            .await
            .map_err(rejected_token)
    }

    /// Backend paths are mapped onto the relay's proxy surface.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<String, TransportError> {
        let token = self.token()?;
        let url = construct_api_url(&self.base_url, &relay_proxy_path(path));
        send_proxied(self.client.request(method, url).bearer_auth(token), body, self.timeout)
            .await
            .map_err(rejected_token)
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }
}

fn rejected_token(err: TransportError) -> TransportError {
    match err {
        TransportError::Http { status, .. } if status == 401 || status == 403 => {
            TransportError::Authentication(format!("relay rejected the token (HTTP {status})"))
        }
        other => other,
    }
}

fn socket_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                TransportError::Authentication(format!("relay rejected the bridge token (HTTP {status})"))
            } else {
                TransportError::Http {
                    status,
                    body: String::new(),
                }
            }
        }
        tungstenite::Error::Io(err) => TransportError::Connectivity(err.to_string()),
        other => TransportError::Protocol(format!("bridge handshake failed: {other}")),
    }
}

async fn write_frames(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::Receiver<BridgeMessage>,
    watch: LinkWatch,
) {
    loop {
        tokio::select! {
            _ = watch.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let text = match encode(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "Dropping unencodable bridge message");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    watch.lost(TransportError::Protocol(format!("bridge write failed: {err}")));
                    break;
                }
            }
        }
    }
}

async fn read_frames(
    mut source: SplitStream<Socket>,
    endpoint: BridgeEndpoint,
    watch: LinkWatch,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = watch.cancel.cancelled() => break,
            frame = source.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                if let Err(err) = endpoint.handle_frame(&text).await {
                    watch.lost(err);
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                watch.lost(TransportError::Protocol(
                    "relay closed the bridge socket".to_string(),
                ));
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                watch.lost(TransportError::Protocol(format!("bridge read failed: {err}")));
                break;
            }
        }
    }
    endpoint.close().await;
}

async fn keep_alive(endpoint: BridgeEndpoint, every: Duration, pong_timeout: Duration, watch: LinkWatch) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = watch.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = endpoint.ping(pong_timeout).await {
                    watch.lost(err);
                    break;
                }
            }
        }
    }
}
