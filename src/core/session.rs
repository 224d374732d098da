use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ChatRequest;
use crate::core::bridge::message::new_message_id;
use crate::core::broker::ConnectionBroker;
use crate::core::chat_stream::{pump_ndjson, NdjsonDecoder, PumpOutcome, StreamingEvent};
use crate::core::error::SessionError;
use crate::core::transport::{TransportAdapter, TransportId};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub prompt: String,
    pub model: String,
    pub conversation_id: String,
    /// Prior messages, forwarded verbatim.
    pub history: Vec<Value>,
}

struct ActiveStream {
    stream_id: u64,
    cancel: CancellationToken,
}

type ActiveStreams = Arc<Mutex<HashMap<String, ActiveStream>>>;

/// Binds chat requests to the best available transport, one live stream per
/// conversation.
pub struct StreamingSessionManager {
    broker: Arc<ConnectionBroker>,
    active: ActiveStreams,
    read_timeout: Duration,
    next_stream_id: AtomicU64,
}

impl StreamingSessionManager {
    pub fn new(broker: Arc<ConnectionBroker>, read_timeout: Duration) -> Self {
        Self {
            broker,
            active: Arc::new(Mutex::new(HashMap::new())),
            read_timeout,
            next_stream_id: AtomicU64::new(0),
        }
    }

    pub fn broker(&self) -> &Arc<ConnectionBroker> {
        &self.broker
    }

    /// Starts streaming a reply. A previous stream for the same conversation
    /// is cancelled first.
    ///
    /// Failures to reach any transport are not errors here: the returned
    /// stream carries a single terminal [`StreamingEvent::Error`]. Only a
    /// broker with no transports at all is rejected.
    pub async fn stream(&self, request: StreamRequest) -> Result<ChatStream, SessionError> {
        if self.broker.transport_count() == 0 {
            return Err(SessionError::NoTransportsConfigured);
        }

        let message_id = new_message_id();
        let cancel = CancellationToken::new();
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let superseded = lock(&self.active).insert(
            request.conversation_id.clone(),
            ActiveStream {
                stream_id,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = superseded {
            debug!(conversation = %request.conversation_id, "Cancelling superseded stream");
            previous.cancel.cancel();
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let mut adapter = self.broker.best_adapter();
        if adapter.is_none() {
            debug!("No transport connected; reconnecting before streaming");
            self.broker.reconnect_all(false).await;
            adapter = self.broker.best_adapter();
        }

        let Some(adapter) = adapter else {
            let message = self
                .broker
                .status()
                .aggregate_error
                .unwrap_or_else(|| "No transport connected".to_string());
            warn!(conversation = %request.conversation_id, error = %message, "No transport for stream");
            let mut decoder = NdjsonDecoder::new(message_id.clone());
            if let Some(event) = decoder.fail(message) {
                let _ = tx.try_send(event);
            }
            release(&self.active, &request.conversation_id, stream_id);
            return Ok(ChatStream {
                message_id,
                transport: None,
                rx,
                cancel,
            });
        };

        let transport = adapter.id();
        info!(
            conversation = %request.conversation_id,
            message_id = %message_id,
            transport = %transport,
            model = %request.model,
            "Starting stream"
        );

        let chat = ChatRequest::with_prompt(request.model, request.history, &request.prompt);
        tokio::spawn(run_stream(StreamTask {
            adapter,
            chat,
            decoder: NdjsonDecoder::new(message_id.clone()),
            read_timeout: self.read_timeout,
            cancel: cancel.clone(),
            tx,
            active: Arc::clone(&self.active),
            conversation_id: request.conversation_id,
            stream_id,
        }));

        Ok(ChatStream {
            message_id,
            transport: Some(transport),
            rx,
            cancel,
        })
    }

    /// Returns whether a live stream was cancelled.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        match lock(&self.active).remove(conversation_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, active) in lock(&self.active).drain() {
            active.cancel.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

struct StreamTask {
    adapter: Arc<TransportAdapter>,
    chat: ChatRequest,
    decoder: NdjsonDecoder,
    read_timeout: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<StreamingEvent>,
    active: ActiveStreams,
    conversation_id: String,
    stream_id: u64,
}

async fn run_stream(task: StreamTask) {
    let StreamTask {
        adapter,
        chat,
        mut decoder,
        read_timeout,
        cancel,
        tx,
        active,
        conversation_id,
        stream_id,
    } = task;
    let _streaming = adapter.begin_stream();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        opened = adapter.open_stream(&chat) => Some(opened),
    };

    let failure = match opened {
        None => None,
        Some(Err(err)) => {
            if let Some(event) = decoder.fail(err.to_string()) {
                let _ = tx.send(event).await;
            }
            Some(err)
        }
        Some(Ok(body)) => match pump_ndjson(body, decoder, read_timeout, cancel.clone(), tx).await {
            PumpOutcome::Failed(err) => Some(err),
            PumpOutcome::Completed | PumpOutcome::Cancelled => None,
        },
    };

    if let Some(err) = failure {
        if err.is_link_failure() {
            adapter.report_failure(err);
        } else {
            debug!(transport = %adapter.id(), error = %err, "Stream failed without a transport fault");
        }
    }

    release(&active, &conversation_id, stream_id);
}

/// Forgets the conversation's entry unless a newer stream replaced it.
fn release(active: &ActiveStreams, conversation_id: &str, stream_id: u64) {
    let mut active = lock(active);
    if active
        .get(conversation_id)
        .is_some_and(|entry| entry.stream_id == stream_id)
    {
        active.remove(conversation_id);
    }
}

fn lock(active: &ActiveStreams) -> MutexGuard<'_, HashMap<String, ActiveStream>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Events for one assistant message, in sequence order.
///
/// Ends after the terminal event, or immediately once cancelled; a cancelled
/// stream never yields another event. Dropping it cancels the request.
pub struct ChatStream {
    message_id: String,
    transport: Option<TransportId>,
    rx: mpsc::Receiver<StreamingEvent>,
    cancel: CancellationToken,
}

impl ChatStream {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The transport serving this stream, if one was available.
    pub fn transport(&self) -> Option<TransportId> {
        self.transport
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for ChatStream {
    type Item = StreamingEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
