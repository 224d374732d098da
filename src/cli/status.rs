//! `status` and `serve` commands.

use std::error::Error;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::core::auth::Authenticator;
use crate::core::broker::{ConnectionBroker, ConnectionSnapshot};
use crate::core::config::Config;
use crate::core::transport::{LinkState, TransportEvent, TransportSnapshot};

pub async fn run_status(
    config: &Config,
    auth: Arc<dyn Authenticator>,
    force: bool,
) -> Result<(), Box<dyn Error>> {
    let broker = ConnectionBroker::from_config(config, auth);
    if broker.transport_count() == 0 {
        return Err("No transports are enabled; enable one in the config file".into());
    }

    broker.reconnect_all(force).await;
    for line in format_status(&broker.status()) {
        println!("{line}");
    }
    broker.shutdown().await;
    Ok(())
}

pub async fn run_serve(config: &Config, auth: Arc<dyn Authenticator>) -> Result<(), Box<dyn Error>> {
    let broker = ConnectionBroker::from_config(config, auth);
    if broker.transport_count() == 0 {
        return Err("No transports are enabled; enable one in the config file".into());
    }

    let mut events = broker.subscribe();
    broker.start();
    println!("🔌 Keeping transports connected. Press Ctrl-C to stop.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", format_event(&event)),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped transport events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    println!();
    for line in format_status(&broker.status()) {
        println!("{line}");
    }
    broker.shutdown().await;
    Ok(())
}

pub fn format_status(snapshot: &ConnectionSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    match snapshot.best_transport {
        Some(best) => lines.push(format!("✅ Connected via {best}")),
        None => lines.push(format!(
            "❌ Not connected: {}",
            snapshot
                .aggregate_error
                .as_deref()
                .unwrap_or("no transport connected")
        )),
    }
    lines.push("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".to_string());
    for transport in &snapshot.transports {
        lines.extend(format_transport(transport));
    }
    lines
}

fn format_transport(transport: &TransportSnapshot) -> Vec<String> {
    let marker = match transport.state {
        LinkState::Connected | LinkState::Streaming => "●",
        LinkState::Connecting => "◐",
        LinkState::Disconnected | LinkState::Error => "○",
    };
    let mut lines = vec![format!("{marker} {:<8} {}", transport.id.as_str(), transport.state)];

    if !transport.supported {
        lines.push("    unsupported on this platform".to_string());
    }
    if let Some(endpoint) = &transport.status.endpoint {
        lines.push(format!("    endpoint: {endpoint}"));
    }
    if let Some(latency) = transport.status.latency {
        lines.push(format!("    latency:  {}ms", latency.as_millis()));
    }
    if let Some(error) = &transport.status.error {
        lines.push(format!("    error:    {error}"));
    }
    if transport.circuit_open {
        lines.push(format!(
            "    circuit open after {} failed attempts",
            transport.retry_attempt
        ));
    }
    lines
}

fn format_event(event: &TransportEvent) -> String {
    match (&event.state, &event.error) {
        (LinkState::Error, Some(error)) => format!("  {} → {} ({error})", event.id, event.state),
        _ => format!("  {} → {}", event.id, event.state),
    }
}
