//! In-process fakes for the local backend and the relay.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Path including the query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct FakeResponse {
    status: u16,
    content_type: &'static str,
    chunks: Vec<Vec<u8>>,
    chunk_delay: Duration,
    hold_open: bool,
}

impl FakeResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            chunks: vec![body.as_bytes().to_vec()],
            chunk_delay: Duration::ZERO,
            hold_open: false,
        }
    }

    /// One write per line, each terminated with `\n`.
    pub fn ndjson(lines: &[&str]) -> Self {
        Self::chunked(lines.iter().map(|line| format!("{line}\n")).collect())
    }

    /// Raw body writes, split exactly as given.
    pub fn chunked(chunks: Vec<String>) -> Self {
        Self {
            status: 200,
            content_type: "application/x-ndjson",
            chunks: chunks.into_iter().map(String::into_bytes).collect(),
            chunk_delay: Duration::from_millis(5),
            hold_open: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Keeps the connection open after the last chunk instead of closing it.
    pub fn stalled(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

type Handler = Arc<dyn Fn(&RecordedRequest) -> FakeResponse + Send + Sync>;
pub type BridgeHandler = Arc<
    dyn Fn(WebSocketStream<TcpStream>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// A loopback HTTP/1.1 server that answers every request through a closure
/// and records what it saw. Requests to `/ws/bridge` are upgraded to a
/// WebSocket and handed to the bridge handler when one is installed.
pub struct FakeBackend {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> FakeResponse + Send + Sync + 'static,
    {
        Self::start_inner(Arc::new(handler), None).await
    }

    pub async fn start_with_bridge<F>(handler: F, bridge: BridgeHandler) -> Self
    where
        F: Fn(&RecordedRequest) -> FakeResponse + Send + Sync + 'static,
    {
        Self::start_inner(Arc::new(handler), Some(bridge)).await
    }

    async fn start_inner(handler: Handler, bridge: Option<BridgeHandler>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("local addr should resolve");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                let recorded = Arc::clone(&recorded);
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, handler, recorded, bridge).await;
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Handler,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    bridge: Option<BridgeHandler>,
) -> Result<(), String> {
    if let Some(bridge) = bridge {
        let mut peeked = [0_u8; 32];
        let read = stream.peek(&mut peeked).await.map_err(|err| err.to_string())?;
        if peeked[..read].starts_with(b"GET /ws/bridge") {
            let socket = tokio_tungstenite::accept_async(stream)
                .await
                .map_err(|err| err.to_string())?;
            bridge(socket).await;
            return Ok(());
        }
    }

    let request = read_http_request(&mut stream).await?;
    let response = handler(&request);
    recorded.lock().await.push(request);

    let mut head = format!(
        "HTTP/1.1 {} OK\r\ncontent-type: {}\r\nconnection: close\r\n",
        response.status, response.content_type
    );
    if response.chunks.len() == 1 && !response.hold_open {
        head.push_str(&format!("content-length: {}\r\n", response.chunks[0].len()));
    }
    head.push_str("\r\n");
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|err| err.to_string())?;

    for (index, chunk) in response.chunks.iter().enumerate() {
        if index > 0 && !response.chunk_delay.is_zero() {
            tokio::time::sleep(response.chunk_delay).await;
        }
        stream.write_all(chunk).await.map_err(|err| err.to_string())?;
        stream.flush().await.map_err(|err| err.to_string())?;
    }

    if response.hold_open {
        std::future::pending::<()>().await;
    }
    stream.shutdown().await.map_err(|err| err.to_string())
}

async fn read_http_request(stream: &mut TcpStream) -> Result<RecordedRequest, String> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    while header_end.is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP headers".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|index| index + 4);
    }

    let header_end = header_end.ok_or_else(|| "missing header end".to_string())?;
    let header_text =
        std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
    let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| "Missing HTTP request line".to_string())?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    let mut content_length = 0_usize;
    for line in lines {
        let mut parts = line.splitn(2, ':');
        let Some(name) = parts.next() else {
            continue;
        };
        let value = parts.next().unwrap_or_default().trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
        }
        headers.push((name.to_string(), value));
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0_u8; content_length.saturating_sub(body.len())];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP body".to_string());
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// A client that never routes loopback traffic through an environment proxy.
pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client should build")
}
