use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::retry::{RetryPolicy, DEFAULT_JITTER_RATIO};
use crate::core::transport::TransportId;

/// Where the process runs. Decides which transports can work at all.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Desktop,
    Web,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LocalConfig {
    pub enabled: bool,
    /// Base URL of the Ollama-compatible backend.
    pub base_url: String,
    pub probe_timeout_ms: u64,
    /// Deadline for requests the bridge forwards to the backend.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub base_url: String,
    pub keep_alive_secs: u64,
    pub pong_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IngressProvider {
    #[default]
    Ngrok,
    Cloudflared,
    Custom,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct IngressConfig {
    pub enabled: bool,
    pub provider: IngressProvider,
    /// Overrides the binary name looked up on `PATH`.
    pub binary: Option<String>,
    /// Extra arguments for a custom provider. `{target}` is replaced with
    /// the local backend address.
    pub args: Vec<String>,
    /// Host suffixes a public URL must end with. Empty means the provider's
    /// built-in suffixes.
    pub url_suffixes: Vec<String>,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub startup_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub priority: Vec<TransportId>,
    pub connection_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_secs: u64,
    pub circuit_cooldown_secs: u64,
    /// Per-read deadline while a chat response is streaming.
    pub stream_read_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub platform: Platform,
    pub local: LocalConfig,
    pub relay: RelayConfig,
    pub ingress: IngressConfig,
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Configured priority order with duplicates and disabled transports
    /// removed.
    pub fn transport_order(&self) -> Vec<TransportId> {
        let mut order = Vec::new();
        for id in &self.connection.priority {
            if !order.contains(id) && self.is_enabled(*id) {
                order.push(*id);
            }
        }
        order
    }

    pub fn is_enabled(&self, id: TransportId) -> bool {
        match id {
            TransportId::Local => self.local.enabled,
            TransportId::Relay => self.relay.enabled,
            TransportId::Ingress => self.ingress.enabled,
        }
    }
}

impl LocalConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RelayConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

impl IngressConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// `protocol://host:port` of the backend the tunnel should expose.
    pub fn target(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl ConnectionConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn stream_read_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_read_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_retry_delay_ms),
            max_delay: Duration::from_secs(self.max_retry_delay_secs),
            max_attempts: self.max_reconnect_attempts.max(1),
            cooldown: Duration::from_secs(self.circuit_cooldown_secs),
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
