use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ChatChunk;
use crate::core::error::TransportError;
use crate::utils::lines::LineBuffer;

/// Typed output of a chat stream. Every stream ends with exactly one
/// `Complete` or `Error`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingEvent {
    Chunk {
        message_id: String,
        sequence: u64,
        text: String,
    },
    Complete {
        message_id: String,
        sequence: u64,
    },
    Error {
        message_id: String,
        sequence: u64,
        message: String,
    },
}

impl StreamingEvent {
    pub fn message_id(&self) -> &str {
        match self {
            StreamingEvent::Chunk { message_id, .. }
            | StreamingEvent::Complete { message_id, .. }
            | StreamingEvent::Error { message_id, .. } => message_id,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            StreamingEvent::Chunk { sequence, .. }
            | StreamingEvent::Complete { sequence, .. }
            | StreamingEvent::Error { sequence, .. } => *sequence,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamingEvent::Chunk { .. })
    }
}

/// Incremental NDJSON decoder for one assistant message.
///
/// Once a terminal event has been produced the decoder ignores all further
/// input; it cannot be restarted.
pub struct NdjsonDecoder {
    message_id: String,
    next_sequence: u64,
    finished: bool,
    truncated: bool,
    lines: LineBuffer,
}

impl NdjsonDecoder {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            next_sequence: 0,
            finished: false,
            truncated: false,
            lines: LineBuffer::default(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True when input ended without a terminal line.
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    /// Decodes one complete line. Malformed lines are logged and skipped.
    pub fn decode_line(&mut self, line: &str) -> Vec<StreamingEvent> {
        let mut events = Vec::new();
        let line = line.trim();
        if self.finished || line.is_empty() {
            return events;
        }

        let chunk = match serde_json::from_str::<ChatChunk>(line) {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(
                    message_id = %self.message_id,
                    error = %err,
                    "Skipping malformed stream line"
                );
                return events;
            }
        };

        if let Some(message) = chunk.error_message() {
            events.push(self.terminal_error(message));
            return events;
        }

        if let Some(text) = chunk.content() {
            let sequence = self.advance();
            events.push(StreamingEvent::Chunk {
                message_id: self.message_id.clone(),
                sequence,
                text: text.to_string(),
            });
        }

        if chunk.done {
            let sequence = self.advance();
            self.finished = true;
            events.push(StreamingEvent::Complete {
                message_id: self.message_id.clone(),
                sequence,
            });
        }

        events
    }

    /// Feeds raw bytes, reassembling lines split across reads.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<StreamingEvent> {
        let lines = self.lines.push(bytes);
        self.decode_buffered(lines)
    }

    /// Signals end of input. A stream that never reported `done` is
    /// truncated and ends with an `Error`.
    pub fn finish(&mut self) -> Vec<StreamingEvent> {
        let lines = self.lines.finish();
        let mut events = self.decode_buffered(lines);
        if !self.finished {
            self.truncated = true;
            events.push(self.terminal_error("stream ended before completion".to_string()));
        }
        events
    }

    /// Ends the message with a transport failure. Returns `None` if a
    /// terminal event was already produced.
    pub fn fail(&mut self, cause: impl Into<String>) -> Option<StreamingEvent> {
        if self.finished {
            return None;
        }
        Some(self.terminal_error(cause.into()))
    }

    fn decode_buffered(
        &mut self,
        lines: Vec<Result<String, std::str::Utf8Error>>,
    ) -> Vec<StreamingEvent> {
        let mut events = Vec::new();
        for line in lines {
            if self.finished {
                break;
            }
            match line {
                Ok(line) => events.extend(self.decode_line(&line)),
                Err(err) => warn!(
                    message_id = %self.message_id,
                    error = %err,
                    "Invalid UTF-8 in stream"
                ),
            }
        }
        events
    }

    fn terminal_error(&mut self, message: String) -> StreamingEvent {
        let sequence = self.advance();
        self.finished = true;
        self.lines.clear();
        StreamingEvent::Error {
            message_id: self.message_id.clone(),
            sequence,
            message,
        }
    }

    fn advance(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

/// Decodes a complete sequence of lines, including the end-of-input check.
pub fn decode_lines<I, S>(message_id: &str, lines: I) -> Vec<StreamingEvent>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut decoder = NdjsonDecoder::new(message_id);
    let mut events = Vec::new();
    for line in lines {
        events.extend(decoder.decode_line(line.as_ref()));
        if decoder.is_finished() {
            return events;
        }
    }
    events.extend(decoder.finish());
    events
}

/// How a pumped stream ended.
#[derive(Debug)]
pub enum PumpOutcome {
    /// A terminal event derived from the payload was delivered.
    Completed,
    /// The transport failed; a terminal `Error` was delivered.
    Failed(TransportError),
    /// The token fired or the consumer went away. Nothing more was sent.
    Cancelled,
}

/// Drives a byte stream through `decoder`, forwarding events to `tx`.
///
/// Every read is bounded by `read_timeout`. Cancellation stops delivery
/// immediately.
pub async fn pump_ndjson<S>(
    mut stream: S,
    mut decoder: NdjsonDecoder,
    read_timeout: Duration,
    cancel_token: CancellationToken,
    tx: mpsc::Sender<StreamingEvent>,
) -> PumpOutcome
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!(message_id = %decoder.message_id(), "Stream cancelled");
                return PumpOutcome::Cancelled;
            }
            next = tokio::time::timeout(read_timeout, stream.next()) => next,
        };

        let (events, failure) = match next {
            Err(_) => {
                let err = TransportError::Timeout {
                    operation: "stream read",
                    after: read_timeout,
                };
                (decoder.fail(err.to_string()).into_iter().collect(), Some(err))
            }
            Ok(Some(Err(err))) => (
                decoder.fail(err.to_string()).into_iter().collect(),
                Some(err),
            ),
            Ok(Some(Ok(bytes))) => (decoder.push_bytes(&bytes), None),
            Ok(None) => {
                let events = decoder.finish();
                let failure = decoder.was_truncated().then(|| {
                    TransportError::Protocol("stream ended before completion".to_string())
                });
                (events, failure)
            }
        };

        for event in events {
            let delivered = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => false,
                sent = tx.send(event) => sent.is_ok(),
            };
            if !delivered {
                debug!(message_id = %decoder.message_id(), "Stream abandoned while delivering");
                return PumpOutcome::Cancelled;
            }
        }

        if let Some(err) = failure {
            return PumpOutcome::Failed(err);
        }
        if decoder.is_finished() {
            return PumpOutcome::Completed;
        }
    }
}
