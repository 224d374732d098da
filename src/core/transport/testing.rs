//! Scriptable transport for adapter, broker and session tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use reqwest::Method;
use serde_json::Value;

use crate::api::ChatRequest;
use crate::core::error::TransportError;
use crate::core::retry::RetryPolicy;
use crate::core::transport::{
    ByteStream, LinkReporter, ProbeOutcome, Transport, TransportId,
};

#[derive(Clone)]
pub(crate) enum FakeStream {
    /// Emits the lines, then ends.
    Lines(Vec<String>),
    /// Emits the lines, then never yields again.
    Stall(Vec<String>),
    /// Fails to open.
    Refuse(TransportError),
    /// Emits the lines, then fails mid-body.
    Break(Vec<String>, TransportError),
}

pub(crate) struct FakeTransport {
    id: TransportId,
    supported: Result<(), String>,
    scripted: Mutex<VecDeque<Result<ProbeOutcome, TransportError>>>,
    fallback: Mutex<Result<ProbeOutcome, TransportError>>,
    probe: Mutex<Result<ProbeOutcome, TransportError>>,
    stream: Mutex<FakeStream>,
    connect_delay: Mutex<Duration>,
    connect_deadline: Option<Duration>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    streams_opened: AtomicUsize,
    reporter: Mutex<Option<LinkReporter>>,
    response: Mutex<Result<String, TransportError>>,
    requests: Mutex<Vec<(Method, String, Option<Value>)>>,
}

pub(crate) fn outcome(id: TransportId) -> ProbeOutcome {
    ProbeOutcome {
        endpoint: format!("fake://{id}"),
        version: Some("0.0.0".to_string()),
    }
}

pub(crate) fn refused() -> TransportError {
    TransportError::Connectivity("connection refused".to_string())
}

pub(crate) fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_attempts,
        cooldown: Duration::from_secs(60),
        jitter_ratio: 0.0,
    }
}

impl FakeTransport {
    pub(crate) fn reachable(id: TransportId) -> Self {
        Self::with_fallback(id, Ok(outcome(id)))
    }

    pub(crate) fn unreachable(id: TransportId) -> Self {
        Self::with_fallback(id, Err(refused()))
    }

    pub(crate) fn with_fallback(id: TransportId, fallback: Result<ProbeOutcome, TransportError>) -> Self {
        Self {
            id,
            supported: Ok(()),
            scripted: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            probe: Mutex::new(Ok(outcome(id))),
            stream: Mutex::new(FakeStream::Lines(vec![
                r#"{"message":{"content":"hi"},"done":false}"#.to_string(),
                r#"{"done":true}"#.to_string(),
            ])),
            connect_delay: Mutex::new(Duration::ZERO),
            connect_deadline: None,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            streams_opened: AtomicUsize::new(0),
            reporter: Mutex::new(None),
            response: Mutex::new(Ok(format!(r#"{{"from":"{id}"}}"#))),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn unsupported(mut self, reason: &str) -> Self {
        self.supported = Err(reason.to_string());
        self
    }

    pub(crate) fn script(self, results: Vec<Result<ProbeOutcome, TransportError>>) -> Self {
        *self.scripted.lock().unwrap() = results.into();
        self
    }

    pub(crate) fn with_stream(self, stream: FakeStream) -> Self {
        *self.stream.lock().unwrap() = stream;
        self
    }

    pub(crate) fn with_connect_delay(self, delay: Duration) -> Self {
        *self.connect_delay.lock().unwrap() = delay;
        self
    }

    pub(crate) fn with_connect_deadline(mut self, deadline: Duration) -> Self {
        self.connect_deadline = Some(deadline);
        self
    }

    pub(crate) fn set_fallback(&self, fallback: Result<ProbeOutcome, TransportError>) {
        *self.fallback.lock().unwrap() = fallback;
    }

    pub(crate) fn set_probe(&self, probe: Result<ProbeOutcome, TransportError>) {
        *self.probe.lock().unwrap() = probe;
    }

    pub(crate) fn set_response(&self, response: Result<String, TransportError>) {
        *self.response.lock().unwrap() = response;
    }

    pub(crate) fn requests(&self) -> Vec<(Method, String, Option<Value>)> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn lose_link(&self, err: TransportError) {
        if let Some(reporter) = self.reporter.lock().unwrap().as_ref() {
            reporter.report(err);
        }
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }
}

fn line_stream(lines: Vec<String>) -> impl futures_util::Stream<Item = Result<Bytes, TransportError>> {
    stream::iter(
        lines
            .into_iter()
            .map(|line| Ok(Bytes::from(format!("{line}\n")))),
    )
}

#[async_trait]
impl Transport for FakeTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn supported(&self) -> Result<(), String> {
        self.supported.clone()
    }

    fn attach(&self, reporter: LinkReporter) {
        *self.reporter.lock().unwrap() = Some(reporter);
    }

    async fn connect(&self) -> Result<ProbeOutcome, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.scripted.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }

    fn connect_deadline(&self, default: Duration) -> Duration {
        self.connect_deadline.unwrap_or(default)
    }

    async fn probe(&self) -> Result<ProbeOutcome, TransportError> {
        self.probe.lock().unwrap().clone()
    }

    async fn open_stream(&self, _request: &ChatRequest) -> Result<ByteStream, TransportError> {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let script = self.stream.lock().unwrap().clone();
        match script {
            FakeStream::Lines(lines) => Ok(line_stream(lines).boxed()),
            FakeStream::Stall(lines) => Ok(line_stream(lines).chain(stream::pending()).boxed()),
            FakeStream::Refuse(err) => Err(err),
            FakeStream::Break(lines, err) => {
                Ok(line_stream(lines).chain(stream::iter([Err(err)])).boxed())
            }
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<String, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((method, path.to_string(), body.cloned()));
        self.response.lock().unwrap().clone()
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
