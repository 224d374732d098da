//! One-shot streaming chat on stdout.

use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;

use futures_util::StreamExt;

use crate::core::auth::Authenticator;
use crate::core::broker::ConnectionBroker;
use crate::core::chat_stream::StreamingEvent;
use crate::core::config::Config;
use crate::core::session::{StreamRequest, StreamingSessionManager};

pub async fn run_say(
    config: &Config,
    auth: Arc<dyn Authenticator>,
    model: String,
    conversation_id: String,
    prompt: String,
) -> Result<(), Box<dyn Error>> {
    if prompt.trim().is_empty() {
        return Err("Usage: localbridge chat -m <model> <prompt>".into());
    }

    let broker = Arc::new(ConnectionBroker::from_config(config, auth));
    let sessions =
        StreamingSessionManager::new(Arc::clone(&broker), config.connection.stream_read_timeout());

    let mut stream = sessions
        .stream(StreamRequest {
            prompt,
            model,
            conversation_id,
            history: Vec::new(),
        })
        .await?;
    if let Some(transport) = stream.transport() {
        eprintln!("📡 via {transport}");
    }

    let mut failure = None;
    let mut stdout = io::stdout();
    while let Some(event) = stream.next().await {
        match event {
            StreamingEvent::Chunk { text, .. } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamingEvent::Complete { .. } => {
                writeln!(stdout)?;
            }
            StreamingEvent::Error { message, .. } => {
                failure = Some(message);
            }
        }
    }
    drop(stream);
    broker.shutdown().await;

    match failure {
        Some(message) => Err(format!("❌ {message}").into()),
        None => Ok(()),
    }
}
