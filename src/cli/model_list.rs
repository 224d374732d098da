//! Model listing functionality
//!
//! Lists the backend's installed models over whichever route is connected.

use std::error::Error;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Method;

use crate::api::models::sort_models;
use crate::api::{ModelTag, TagsResponse};
use crate::core::auth::Authenticator;
use crate::core::broker::ConnectionBroker;
use crate::core::config::Config;

pub async fn list_models(config: &Config, auth: Arc<dyn Authenticator>) -> Result<(), Box<dyn Error>> {
    let broker = ConnectionBroker::from_config(config, auth);
    if broker.transport_count() == 0 {
        return Err("No transports are enabled; check the configuration".into());
    }
    broker.reconnect_all(false).await;
    let proxied = broker.proxy_request(Method::GET, "/api/tags", None).await;
    broker.shutdown().await;

    let (transport, body) = proxied.map_err(|err| format!("❌ {err}"))?;
    let mut tags: TagsResponse = serde_json::from_value(body)?;
    sort_models(&mut tags);

    println!("🤖 Models via {transport}");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();

    if tags.models.is_empty() {
        println!("No models found. Pull one with your backend first.");
        return Ok(());
    }

    println!("Found {} models:", tags.models.len());
    println!();
    for model in &tags.models {
        for line in describe_model(model) {
            println!("{line}");
        }
        println!();
    }
    Ok(())
}

fn describe_model(model: &ModelTag) -> Vec<String> {
    let mut lines = vec![format!("  • {}", model.name)];
    if let Some(size) = model.size.filter(|size| *size > 0) {
        lines.push(format!("    Size: {}", human_size(size)));
    }
    if let Some(modified_at) = model.modified_at.as_deref().filter(|value| !value.is_empty()) {
        // Backends report RFC 3339 with sub-second precision and an offset.
        match DateTime::parse_from_rfc3339(modified_at) {
            Ok(parsed) => lines.push(format!(
                "    Modified: {}",
                parsed.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S UTC")
            )),
            Err(_) => lines.push(format!("    Modified: {modified_at}")),
        }
    }
    lines
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
