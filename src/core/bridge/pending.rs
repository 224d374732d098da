use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::core::bridge::message::BridgeMessage;
use crate::core::error::TransportError;

type Reply = Result<BridgeMessage, TransportError>;

/// Correlation table for messages this side originated, keyed by request
/// id (or ping id, for pongs).
#[derive(Clone, Default)]
pub struct PendingRequests {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id.to_string(), tx);
        rx
    }

    /// Hands `message` to its waiter. Returns false, and drops the message,
    /// when nobody is waiting for its id.
    pub async fn complete(&self, message: BridgeMessage) -> bool {
        let Some(id) = message.correlation_id().map(str::to_owned) else {
            return false;
        };

        let waiter = self.waiters.lock().await.remove(&id);
        match waiter {
            Some(tx) => {
                let reply = match message {
                    BridgeMessage::Error { message, .. } => Err(TransportError::Protocol(message)),
                    other => Ok(other),
                };
                let _ = tx.send(reply);
                true
            }
            None => {
                debug!(
                    message_id = %id,
                    message_type = message.kind(),
                    "Discarding bridge reply with no pending request"
                );
                false
            }
        }
    }

    pub async fn cancel(&self, id: &str) {
        self.waiters.lock().await.remove(id);
    }

    /// Fails every waiter with `err`. Used when the socket goes away.
    pub async fn fail_all(&self, err: TransportError) -> usize {
        let drained: Vec<_> = self.waiters.lock().await.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// Waits for the reply registered under `id`, removing the entry if the
    /// deadline passes first.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<Reply>,
        operation: &'static str,
        timeout: Duration,
    ) -> Reply {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.cancel(id).await;
                Err(TransportError::Timeout {
                    operation,
                    after: timeout,
                })
            }
        }
    }
}
