use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ChatRequest;
use crate::core::error::{ErrorKind, TransportError};
use crate::core::retry::{sample_jitter, RetryPolicy, RetryState};
use crate::core::transport::{
    ByteStream, LinkReporter, LinkState, ProbeOutcome, Transport, TransportId, TransportSnapshot,
    TransportStatus,
};

/// Published on the broker's broadcast channel whenever an adapter changes
/// lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub id: TransportId,
    pub state: LinkState,
    pub error: Option<String>,
}

/// Owns one transport's lifecycle: its connect loop, retry state, status and
/// stream accounting.
pub struct TransportAdapter {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    connect_timeout: Duration,
    supported: Result<(), String>,
    state: watch::Sender<TransportSnapshot>,
    retry: Mutex<RetryState>,
    attempt_lock: tokio::sync::Mutex<()>,
    active_streams: AtomicUsize,
    wake: Notify,
    cancel: CancellationToken,
    events: broadcast::Sender<TransportEvent>,
    link_lost: Mutex<Option<mpsc::UnboundedReceiver<TransportError>>>,
    closed: AtomicBool,
}

impl TransportAdapter {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        connect_timeout: Duration,
        events: broadcast::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let supported = transport.supported();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        transport.attach(LinkReporter::new(link_tx));

        let status = TransportStatus {
            error: supported
                .as_ref()
                .err()
                .map(|reason| TransportError::Unsupported(reason.clone())),
            ..TransportStatus::default()
        };
        let (state, _) = watch::channel(TransportSnapshot {
            id: transport.id(),
            state: LinkState::Disconnected,
            status,
            supported: supported.is_ok(),
            active_streams: 0,
            retry_attempt: 0,
            circuit_open: false,
        });

        Arc::new(Self {
            retry: Mutex::new(policy.initial_state()),
            transport,
            policy,
            connect_timeout,
            supported,
            state,
            attempt_lock: tokio::sync::Mutex::new(()),
            active_streams: AtomicUsize::new(0),
            wake: Notify::new(),
            cancel,
            events,
            link_lost: Mutex::new(Some(link_rx)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> TransportId {
        self.transport.id()
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TransportSnapshot> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn retry_state(&self) -> RetryState {
        self.lock_retry().clone()
    }

    /// Spawns the connect loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move { adapter.run().await })
    }

    /// One connection attempt. Honours the circuit breaker unless
    /// `bypass_circuit` is set; never waits for a backoff delay.
    pub async fn connect_once(&self, bypass_circuit: bool) -> Result<ProbeOutcome, TransportError> {
        if let Err(reason) = &self.supported {
            return Err(TransportError::Unsupported(reason.clone()));
        }
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let _attempt = self.attempt_lock.lock().await;
        let now = Instant::now();
        {
            let mut retry = self.lock_retry();
            let allowed = self.policy.should_attempt(&mut retry, now);
            if !allowed && !bypass_circuit {
                return Err(TransportError::CircuitOpen {
                    retry_in: self.policy.retry_in(&retry, now),
                });
            }
        }

        self.update(Some(LinkState::Connecting), None);
        debug!(transport = %self.id(), "Connecting");
        let deadline = self.transport.connect_deadline(self.connect_timeout);
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            result = tokio::time::timeout(deadline, self.transport.connect()) => {
                result.unwrap_or(Err(TransportError::Timeout {
                    operation: "connect",
                    after: deadline,
                }))
            }
        };

        match result {
            Ok(outcome) => {
                self.record_success(&outcome, started.elapsed());
                Ok(outcome)
            }
            Err(TransportError::Closed) if self.cancel.is_cancelled() => Err(TransportError::Closed),
            Err(err) => {
                self.record_failure(err.clone());
                Err(err)
            }
        }
    }

    /// Attempts immediately and then lets the loop re-evaluate.
    pub async fn reconnect(&self, bypass_circuit: bool) -> Result<ProbeOutcome, TransportError> {
        let result = self.connect_once(bypass_circuit).await;
        self.wake.notify_one();
        result
    }

    /// Re-probes a connected transport and demotes it on failure. Skipped
    /// while a connection attempt is in flight.
    pub async fn health_check(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Ok(());
        }
        let Ok(_attempt) = self.attempt_lock.try_lock() else {
            return Ok(());
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.connect_timeout, self.transport.probe())
            .await
            .unwrap_or(Err(TransportError::Timeout {
                operation: "health probe",
                after: self.connect_timeout,
            }));

        match result {
            Ok(outcome) => {
                let status = TransportStatus {
                    connected: true,
                    endpoint: Some(outcome.endpoint),
                    last_check: Some(Utc::now()),
                    latency: Some(started.elapsed()),
                    error: None,
                };
                self.update(None, Some(status));
                Ok(())
            }
            Err(err) => {
                warn!(transport = %self.id(), error = %err, "Health probe failed");
                self.record_failure(err.clone());
                self.wake.notify_one();
                Err(err)
            }
        }
    }

    /// Feeds a failure observed outside the connect loop (a broken stream,
    /// a dropped socket) into the retry policy. Ignored unless the adapter
    /// currently believes it is connected.
    pub fn report_failure(&self, err: TransportError) {
        if self.closed.load(Ordering::SeqCst) || !self.is_connected() {
            debug!(transport = %self.id(), error = %err, "Ignoring failure report");
            return;
        }
        warn!(transport = %self.id(), error = %err, "Transport failure reported");
        self.record_failure(err);
        self.wake.notify_one();
    }

    pub fn begin_stream(self: &Arc<Self>) -> StreamGuard {
        self.active_streams.fetch_add(1, Ordering::SeqCst);
        let next = (self.state() == LinkState::Connected).then_some(LinkState::Streaming);
        self.update(next, None);
        StreamGuard {
            adapter: Arc::clone(self),
        }
    }

    fn end_stream(&self) {
        let remaining = self
            .active_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            })
            .map(|previous| previous.saturating_sub(1))
            .unwrap_or(0);
        let next = (remaining == 0 && self.state() == LinkState::Streaming)
            .then_some(LinkState::Connected);
        self.update(next, None);
    }

    pub async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Connectivity(format!(
                "{} transport is not connected",
                self.id()
            )));
        }
        self.transport.open_stream(request).await
    }

    /// Forwards a non-streaming request. Link failures demote the adapter.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<String, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Connectivity(format!(
                "{} transport is not connected",
                self.id()
            )));
        }
        let result = self.transport.request(method, path, body).await;
        if let Err(err) = &result {
            if err.is_link_failure() {
                self.report_failure(err.clone());
            }
        }
        result
    }

    /// Stops the loop and tears the transport down. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.transport.disconnect().await;

        let previous = self.snapshot().status;
        let status = TransportStatus {
            connected: false,
            endpoint: previous.endpoint,
            last_check: previous.last_check,
            latency: None,
            error: None,
        };
        self.update(Some(LinkState::Disconnected), Some(status));
        info!(transport = %self.id(), "Transport closed");
    }

    async fn run(self: Arc<Self>) {
        let mut link_lost = self
            .link_lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let snapshot = self.snapshot();
            if snapshot.state.is_connected() || Self::is_parked(&snapshot) {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.wake.notified() => {}
                    Some(err) = recv_link(&mut link_lost) => self.report_failure(err),
                }
                continue;
            }

            let delay = self.backoff_delay();
            if !delay.is_zero() {
                debug!(
                    transport = %self.id(),
                    delay_ms = delay.as_millis() as u64,
                    "Waiting before reconnect"
                );
                let woken = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => false,
                    _ = self.wake.notified() => true,
                };
                if woken {
                    continue;
                }
            }

            if let Err(TransportError::CircuitOpen { retry_in }) = self.connect_once(false).await {
                debug!(
                    transport = %self.id(),
                    retry_in_secs = retry_in.as_secs(),
                    "Circuit open; suppressing attempts"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry_in.max(self.policy.base_delay)) => {}
                    _ = self.wake.notified() => {}
                }
            }
        }
        debug!(transport = %self.id(), "Connect loop stopped");
    }

    /// Not connected, and the last error is one the loop must not retry on
    /// its own.
    fn is_parked(snapshot: &TransportSnapshot) -> bool {
        match &snapshot.status.error {
            Some(err) => matches!(
                err,
                TransportError::Unsupported(_) | TransportError::Closed
            ) || err.kind() == ErrorKind::Authentication,
            None => false,
        }
    }

    fn backoff_delay(&self) -> Duration {
        let retry = self.lock_retry();
        if retry.circuit_open || retry.attempt == 0 {
            Duration::ZERO
        } else {
            retry.current_delay
        }
    }

    fn record_success(&self, outcome: &ProbeOutcome, latency: Duration) {
        {
            let mut retry = self.lock_retry();
            *retry = self.policy.on_success(&retry);
        }
        let state = if self.active_streams.load(Ordering::SeqCst) > 0 {
            LinkState::Streaming
        } else {
            LinkState::Connected
        };
        let status = TransportStatus {
            connected: true,
            endpoint: Some(outcome.endpoint.clone()),
            last_check: Some(Utc::now()),
            latency: Some(latency),
            error: None,
        };
        self.update(Some(state), Some(status));
        info!(
            transport = %self.id(),
            endpoint = %outcome.endpoint,
            version = outcome.version.as_deref().unwrap_or("unknown"),
            latency_ms = latency.as_millis() as u64,
            "Transport connected"
        );
    }

    fn record_failure(&self, err: TransportError) {
        let circuit_open = {
            let mut retry = self.lock_retry();
            if err.is_retryable() {
                *retry = self.policy.on_failure(&retry, Instant::now(), sample_jitter());
            } else {
                retry.probe_pending = false;
            }
            retry.circuit_open
        };

        let previous = self.snapshot().status;
        let status = TransportStatus {
            connected: false,
            endpoint: previous.endpoint,
            last_check: Some(Utc::now()),
            latency: None,
            error: Some(err.clone()),
        };
        self.update(Some(LinkState::Error), Some(status));
        warn!(transport = %self.id(), error = %err, circuit_open, "Transport attempt failed");

        if circuit_open {
            self.update(Some(LinkState::Disconnected), None);
        }
    }

    fn update(&self, state: Option<LinkState>, status: Option<TransportStatus>) {
        let retry = self.retry_state();
        let active_streams = self.active_streams.load(Ordering::SeqCst);
        let mut changed = None;

        self.state.send_modify(|snapshot| {
            if let Some(status) = status {
                snapshot.status = status;
            }
            snapshot.active_streams = active_streams;
            snapshot.retry_attempt = retry.attempt;
            snapshot.circuit_open = retry.circuit_open;
            if let Some(state) = state {
                if snapshot.state != state {
                    snapshot.state = state;
                    changed = Some(TransportEvent {
                        id: snapshot.id,
                        state,
                        error: snapshot.status.error.as_ref().map(ToString::to_string),
                    });
                }
            }
        });

        if let Some(event) = changed {
            debug!(transport = %event.id, state = %event.state, "Transport state changed");
            let _ = self.events.send(event);
        }
    }

    fn lock_retry(&self) -> MutexGuard<'_, RetryState> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn recv_link(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportError>>,
) -> Option<TransportError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Keeps the adapter in `Streaming` while alive.
pub struct StreamGuard {
    adapter: Arc<TransportAdapter>,
}

impl StreamGuard {
    pub fn adapter(&self) -> &Arc<TransportAdapter> {
        &self.adapter
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.adapter.end_stream();
    }
}
