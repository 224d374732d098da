use crate::core::config::data::{
    ConnectionConfig, IngressConfig, IngressProvider, LocalConfig, RelayConfig,
};
use crate::core::transport::TransportId;

pub const DEFAULT_LOCAL_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_RELAY_BASE_URL: &str = "https://app.cloudtolocalllm.online";

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: DEFAULT_LOCAL_BASE_URL.to_string(),
            probe_timeout_ms: 3_000,
            request_timeout_secs: 60,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: DEFAULT_RELAY_BASE_URL.to_string(),
            keep_alive_secs: 30,
            pong_timeout_secs: 10,
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: IngressProvider::Ngrok,
            binary: None,
            args: Vec::new(),
            url_suffixes: Vec::new(),
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            startup_timeout_secs: 30,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            priority: vec![TransportId::Local, TransportId::Relay, TransportId::Ingress],
            connection_timeout_secs: 10,
            health_check_interval_secs: 30,
            max_reconnect_attempts: 10,
            base_retry_delay_ms: 1_000,
            max_retry_delay_secs: 60,
            circuit_cooldown_secs: 300,
            stream_read_timeout_secs: 120,
        }
    }
}

impl IngressProvider {
    pub fn default_binary(self) -> Option<&'static str> {
        match self {
            IngressProvider::Ngrok => Some("ngrok"),
            IngressProvider::Cloudflared => Some("cloudflared"),
            IngressProvider::Custom => None,
        }
    }

    /// Host suffixes of the public URLs each provider hands out.
    pub fn default_url_suffixes(self) -> &'static [&'static str] {
        match self {
            IngressProvider::Ngrok => &[".ngrok-free.app", ".ngrok.app", ".ngrok.io"],
            IngressProvider::Cloudflared => &[".trycloudflare.com"],
            IngressProvider::Custom => &[],
        }
    }
}
