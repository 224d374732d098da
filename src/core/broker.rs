//! Owns the transport adapters in priority order and answers "which one
//! should I use right now".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::auth::Authenticator;
use crate::core::config::Config;
use crate::core::error::TransportError;
use crate::core::retry::RetryPolicy;
use crate::core::transport::{
    IngressTransport, LocalTransport, ProbeOutcome, RelayTransport, Transport, TransportAdapter,
    TransportEvent, TransportId, TransportSnapshot,
};

const EVENT_CAPACITY: usize = 128;
const MIN_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

/// Aggregate view over every adapter, computed on demand.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub any_connected: bool,
    pub best_transport: Option<TransportId>,
    pub aggregate_error: Option<String>,
    pub transports: Vec<TransportSnapshot>,
}

impl ConnectionSnapshot {
    pub fn transport(&self, id: TransportId) -> Option<&TransportSnapshot> {
        self.transports.iter().find(|snapshot| snapshot.id == id)
    }
}

pub struct ConnectionBroker {
    adapters: Vec<Arc<TransportAdapter>>,
    events: broadcast::Sender<TransportEvent>,
    health_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl ConnectionBroker {
    /// `transports` are in priority order, highest first.
    pub fn new(
        transports: Vec<Arc<dyn Transport>>,
        policy: RetryPolicy,
        connect_timeout: Duration,
        health_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let adapters = transports
            .into_iter()
            .map(|transport| {
                TransportAdapter::new(
                    transport,
                    policy,
                    connect_timeout,
                    events.clone(),
                    cancel.child_token(),
                )
            })
            .collect();

        Self {
            adapters,
            events,
            health_interval,
            cancel,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Builds the enabled transports in configured priority order.
    pub fn from_config(config: &Config, auth: Arc<dyn Authenticator>) -> Self {
        let client = reqwest::Client::new();
        let transports = config
            .transport_order()
            .into_iter()
            .map(|id| -> Arc<dyn Transport> {
                match id {
                    TransportId::Local => Arc::new(LocalTransport::from_config(client.clone(), config)),
                    TransportId::Relay => Arc::new(RelayTransport::from_config(
                        client.clone(),
                        config,
                        Arc::clone(&auth),
                    )),
                    TransportId::Ingress => {
                        Arc::new(IngressTransport::from_config(client.clone(), config))
                    }
                }
            })
            .collect();

        Self::new(
            transports,
            config.connection.retry_policy(),
            config.connection.connection_timeout(),
            config.connection.health_check_interval(),
        )
    }

    /// Spawns every connect loop and the health sweep. Idempotent.
    pub fn start(&self) {
        if self.shut_down.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for adapter in &self.adapters {
            tasks.push(adapter.spawn());
        }

        let adapters = self.adapters.clone();
        let cancel = self.cancel.clone();
        let every = self.health_interval.max(MIN_HEALTH_INTERVAL);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep(&adapters).await;
                    }
                }
            }
        }));

        info!(
            transports = ?self.adapters.iter().map(|adapter| adapter.id()).collect::<Vec<_>>(),
            "Connection broker started"
        );
    }

    pub fn transport_count(&self) -> usize {
        self.adapters.len()
    }

    pub fn status(&self) -> ConnectionSnapshot {
        let transports: Vec<TransportSnapshot> =
            self.adapters.iter().map(|adapter| adapter.snapshot()).collect();
        let best_transport = transports
            .iter()
            .find(|snapshot| snapshot.state.is_connected())
            .map(|snapshot| snapshot.id);

        ConnectionSnapshot {
            any_connected: best_transport.is_some(),
            best_transport,
            aggregate_error: aggregate_error(&transports),
            transports,
        }
    }

    /// First connected transport in priority order.
    pub fn best_transport(&self) -> Option<TransportId> {
        self.best_adapter().map(|adapter| adapter.id())
    }

    pub fn best_adapter(&self) -> Option<Arc<TransportAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.is_connected())
            .cloned()
    }

    pub fn adapter(&self, id: TransportId) -> Option<Arc<TransportAdapter>> {
        self.adapters.iter().find(|adapter| adapter.id() == id).cloned()
    }

    /// Attempts every transport now, skipping backoff. An open circuit is
    /// only bypassed with `manual_override`, and is left as it was.
    pub async fn reconnect_all(
        &self,
        manual_override: bool,
    ) -> Vec<(TransportId, Result<ProbeOutcome, TransportError>)> {
        debug!(manual_override, "Reconnecting all transports");
        join_all(self.adapters.iter().map(|adapter| async move {
            (adapter.id(), adapter.reconnect(manual_override).await)
        }))
        .await
    }

    /// Sends a non-streaming backend request, such as `GET /api/tags`, over
    /// the best connected transport and decodes the JSON reply. Only GET and
    /// POST are proxied.
    pub async fn proxy_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(TransportId, Value), TransportError> {
        if method != Method::GET && method != Method::POST {
            return Err(TransportError::Protocol(format!(
                "unsupported proxy method {method}"
            )));
        }
        let Some(adapter) = self.best_adapter() else {
            let transports: Vec<TransportSnapshot> =
                self.adapters.iter().map(|adapter| adapter.snapshot()).collect();
            return Err(aggregate_failure(&transports).cloned().unwrap_or_else(|| {
                TransportError::Connectivity("No transport connected".to_string())
            }));
        };

        let id = adapter.id();
        debug!(transport = %id, %method, path, "Proxying request");
        let text = adapter.request(method, path, body).await?;
        let value = serde_json::from_str(&text)
            .map_err(|err| TransportError::Protocol(format!("{path}: {err}")))?;
        Ok((id, value))
    }

    /// One health sweep. Returns how many transports were demoted.
    pub async fn health_sweep(&self) -> usize {
        sweep(&self.adapters).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Waits until any transport is connected.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Option<TransportId> {
        let mut events = self.subscribe();
        let wait = async {
            loop {
                if let Some(id) = self.best_transport() {
                    return Some(id);
                }
                match events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Stops every loop and timer and closes all transports. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        join_all(self.adapters.iter().map(|adapter| adapter.close())).await;

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Connection broker shut down");
    }
}

impl Drop for ConnectionBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sweep(adapters: &[Arc<TransportAdapter>]) -> usize {
    join_all(adapters.iter().map(|adapter| adapter.health_check()))
        .await
        .into_iter()
        .filter(Result::is_err)
        .count()
}

/// Nothing when a transport is up; otherwise the first authentication
/// error in priority order, then the first error of any kind.
fn aggregate_failure(transports: &[TransportSnapshot]) -> Option<&TransportError> {
    if transports.iter().any(|snapshot| snapshot.state.is_connected()) {
        return None;
    }

    let errors = || {
        transports
            .iter()
            .filter_map(|snapshot| snapshot.status.error.as_ref())
    };
    errors()
        .find(|err| err.is_authentication())
        .or_else(|| errors().next())
}

fn aggregate_error(transports: &[TransportSnapshot]) -> Option<String> {
    if transports.iter().any(|snapshot| snapshot.state.is_connected()) {
        return None;
    }
    aggregate_failure(transports)
        .map(ToString::to_string)
        .or_else(|| Some("No transport connected".to_string()))
}
