use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::api::models::fetch_version;
use crate::api::ChatRequest;
use crate::core::config::{Config, Platform};
use crate::core::error::TransportError;
use crate::core::transport::{
    post_chat, send_proxied, ByteStream, ProbeOutcome, Transport, TransportId,
};
use crate::utils::url::{construct_api_url, normalize_base_url};

/// Talks to a model backend on this machine over plain HTTP.
pub struct LocalTransport {
    client: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
    request_timeout: Duration,
    platform: Platform,
}

impl LocalTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        probe_timeout: Duration,
        request_timeout: Duration,
        platform: Platform,
    ) -> Self {
        Self {
            client,
            base_url: normalize_base_url(base_url),
            probe_timeout,
            request_timeout,
            platform,
        }
    }

    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        Self::new(
            client,
            &config.local.base_url,
            config.local.probe_timeout(),
            config.local.request_timeout(),
            config.platform,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check_version(&self) -> Result<ProbeOutcome, TransportError> {
        let version = fetch_version(&self.client, &self.base_url, self.probe_timeout).await?;
        debug!(base_url = %self.base_url, version = %version.version, "Local backend answered");
        Ok(ProbeOutcome {
            endpoint: self.base_url.clone(),
            version: Some(version.version),
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn id(&self) -> TransportId {
        TransportId::Local
    }

    fn supported(&self) -> Result<(), String> {
        match self.platform {
            Platform::Desktop => Ok(()),
            Platform::Web => Err("browsers cannot reach a loopback backend".to_string()),
        }
    }

    async fn connect(&self) -> Result<ProbeOutcome, TransportError> {
        self.check_version().await
    }

    async fn probe(&self) -> Result<ProbeOutcome, TransportError> {
        self.check_version().await
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, TransportError> {
        let url = construct_api_url(&self.base_url, "api/chat");
        post_chat(self.client.post(url), request, self.request_timeout).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<String, TransportError> {
        let url = construct_api_url(&self.base_url, path);
        send_proxied(self.client.request(method, url), body, self.request_timeout).await
    }

    async fn disconnect(&self) {}
}
