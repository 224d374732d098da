//! Public ingress transport: a tunnel provider (ngrok, cloudflared or a
//! configured binary) run as a child process that exposes the local backend
//! on a public https URL.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::models::fetch_version;
use crate::api::ChatRequest;
use crate::core::config::{Config, IngressConfig, IngressProvider, Platform};
use crate::core::error::TransportError;
use crate::core::transport::{
    post_chat, send_proxied, ByteStream, ProbeOutcome, Transport, TransportId,
};
use crate::utils::url::construct_api_url;

const TARGET_PLACEHOLDER: &str = "{target}";

struct Tunnel {
    child: Child,
    url: String,
    readers: Vec<JoinHandle<()>>,
}

impl Tunnel {
    async fn stop(mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(error = %err, "Tunnel process already gone");
        }
        for reader in self.readers {
            reader.abort();
        }
    }
}

pub struct IngressTransport {
    client: reqwest::Client,
    provider: IngressProvider,
    binary: Option<String>,
    args: Vec<String>,
    url_suffixes: Vec<String>,
    target: String,
    startup_timeout: Duration,
    probe_timeout: Duration,
    request_timeout: Duration,
    platform: Platform,
    tunnel: Mutex<Option<Tunnel>>,
}

impl IngressTransport {
    pub fn new(
        client: reqwest::Client,
        ingress: &IngressConfig,
        probe_timeout: Duration,
        request_timeout: Duration,
        platform: Platform,
    ) -> Self {
        let url_suffixes = if ingress.url_suffixes.is_empty() {
            ingress
                .provider
                .default_url_suffixes()
                .iter()
                .map(|suffix| suffix.to_string())
                .collect()
        } else {
            ingress.url_suffixes.clone()
        };

        Self {
            client,
            provider: ingress.provider,
            binary: ingress.binary.clone(),
            args: ingress.args.clone(),
            url_suffixes,
            target: ingress.target(),
            startup_timeout: ingress.startup_timeout(),
            probe_timeout,
            request_timeout,
            platform,
            tunnel: Mutex::new(None),
        }
    }

    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        Self::new(
            client,
            &config.ingress,
            config.local.probe_timeout(),
            config.local.request_timeout(),
            config.platform,
        )
    }

    fn binary_name(&self) -> Option<String> {
        self.binary
            .clone()
            .or_else(|| self.provider.default_binary().map(str::to_string))
    }

    /// Arguments for the provider. Configured arguments win; `{target}` in
    /// them is replaced with the backend address.
    pub fn launch_args(&self) -> Vec<String> {
        if !self.args.is_empty() {
            return self
                .args
                .iter()
                .map(|arg| arg.replace(TARGET_PLACEHOLDER, &self.target))
                .collect();
        }
        let target = self.target.clone();
        match self.provider {
            IngressProvider::Ngrok => vec![
                "http".to_string(),
                target,
                "--log".to_string(),
                "stdout".to_string(),
                "--log-format".to_string(),
                "logfmt".to_string(),
            ],
            IngressProvider::Cloudflared => {
                vec!["tunnel".to_string(), "--url".to_string(), target]
            }
            IngressProvider::Custom => vec![target],
        }
    }

    async fn current_url(&self) -> Result<String, TransportError> {
        let mut tunnel = self.tunnel.lock().await;
        let Some(active) = tunnel.as_mut() else {
            return Err(TransportError::Connectivity(
                "tunnel is not running".to_string(),
            ));
        };
        if let Ok(Some(status)) = active.child.try_wait() {
            let url = active.url.clone();
            tunnel.take();
            return Err(TransportError::Connectivity(format!(
                "tunnel process for {url} exited ({status})"
            )));
        }
        Ok(active.url.clone())
    }

    async fn stop_tunnel(&self) {
        let tunnel = self.tunnel.lock().await.take();
        if let Some(tunnel) = tunnel {
            info!(url = %tunnel.url, "Stopping tunnel");
            tunnel.stop().await;
        }
    }
}

#[async_trait]
impl Transport for IngressTransport {
    fn id(&self) -> TransportId {
        TransportId::Ingress
    }

    fn supported(&self) -> Result<(), String> {
        match self.platform {
            Platform::Desktop => Ok(()),
            Platform::Web => Err("tunnel providers cannot be launched from a browser".to_string()),
        }
    }

    async fn connect(&self) -> Result<ProbeOutcome, TransportError> {
        self.stop_tunnel().await;

        let binary = self.binary_name().ok_or_else(|| {
            TransportError::Unsupported("custom ingress provider needs a binary".to_string())
        })?;
        let path = find_on_path(&binary)
            .ok_or_else(|| TransportError::Unsupported(format!("{binary} was not found on PATH")))?;

        let args = self.launch_args();
        debug!(binary = %path.display(), ?args, "Launching tunnel provider");
        let mut child = Command::new(&path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TransportError::Connectivity(format!("failed to launch {binary}: {err}")))?;

        let (url_tx, mut url_rx) = watch::channel(None::<String>);
        let url_tx = Arc::new(url_tx);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(scan_output(
                stdout,
                self.url_suffixes.clone(),
                Arc::clone(&url_tx),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(scan_output(
                stderr,
                self.url_suffixes.clone(),
                Arc::clone(&url_tx),
            )));
        }
        drop(url_tx);

        let waited = tokio::time::timeout(self.startup_timeout, async {
            tokio::select! {
                found = url_rx.wait_for(Option::is_some) => {
                    Ok(found.ok().and_then(|url| url.clone()))
                }
                status = child.wait() => Err(status),
            }
        })
        .await;

        let url = match waited {
            Ok(Ok(Some(url))) => url,
            Ok(Ok(None)) => {
                Tunnel { child, url: String::new(), readers }.stop().await;
                return Err(TransportError::Connectivity(format!(
                    "{binary} stopped printing output without a public URL"
                )));
            }
            Ok(Err(status)) => {
                for reader in readers {
                    reader.abort();
                }
                let status = status
                    .map(|status| status.to_string())
                    .unwrap_or_else(|err| err.to_string());
                return Err(TransportError::Connectivity(format!(
                    "{binary} exited before publishing a URL ({status})"
                )));
            }
            Err(_) => {
                Tunnel { child, url: String::new(), readers }.stop().await;
                return Err(TransportError::Timeout {
                    operation: "tunnel startup",
                    after: self.startup_timeout,
                });
            }
        };

        info!(provider = ?self.provider, url = %url, "Tunnel published a public URL");
        let version = match fetch_version(&self.client, &url, self.probe_timeout).await {
            Ok(version) => version,
            Err(err) => {
                Tunnel { child, url, readers }.stop().await;
                return Err(err);
            }
        };

        *self.tunnel.lock().await = Some(Tunnel {
            child,
            url: url.clone(),
            readers,
        });
        Ok(ProbeOutcome {
            endpoint: url,
            version: Some(version.version),
        })
    }

    /// Startup waits for the provider, then probes through the tunnel.
    fn connect_deadline(&self, default: Duration) -> Duration {
        default.max(self.startup_timeout + self.probe_timeout)
    }

    async fn probe(&self) -> Result<ProbeOutcome, TransportError> {
        let url = self.current_url().await?;
        let version = fetch_version(&self.client, &url, self.probe_timeout).await?;
        Ok(ProbeOutcome {
            endpoint: url,
            version: Some(version.version),
        })
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, TransportError> {
        let url = self.current_url().await?;
        post_chat(
            self.client.post(construct_api_url(&url, "api/chat")),
            request,
            self.request_timeout,
        )
        .await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<String, TransportError> {
        let url = self.current_url().await?;
        send_proxied(
            self.client.request(method, construct_api_url(&url, path)),
            body,
            self.request_timeout,
        )
        .await
    }

    async fn disconnect(&self) {
        self.stop_tunnel().await;
    }
}

async fn scan_output<R>(reader: R, suffixes: Vec<String>, url_tx: Arc<watch::Sender<Option<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(line = %line.trim_end(), "tunnel output");
                if url_tx.borrow().is_some() {
                    continue;
                }
                if let Some(url) = extract_public_url(&line, &suffixes) {
                    url_tx.send_replace(Some(url));
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "Failed to read tunnel output");
                break;
            }
        }
    }
}

/// First `https://` URL on the line whose host ends with one of `suffixes`.
/// With no suffixes, any https URL matches.
pub fn extract_public_url(line: &str, suffixes: &[String]) -> Option<String> {
    let mut rest = line;
    while let Some(start) = rest.find("https://") {
        let candidate = &rest[start..];
        let end = candidate
            .find(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '|' | '<' | '>' | ','))
            .unwrap_or(candidate.len());
        let url = candidate[..end].trim_end_matches(['/', '.', ')']);

        let host = url
            .strip_prefix("https://")
            .and_then(|rest| rest.split(['/', ':', '?']).next())
            .unwrap_or_default();
        let matches = !host.is_empty()
            && (suffixes.is_empty() || suffixes.iter().any(|suffix| host.ends_with(suffix.as_str())));
        if matches {
            return Some(url.to_string());
        }
        rest = &candidate[end.max(1)..];
    }
    None
}

/// Resolves `binary` the way a shell would. Names containing a path
/// separator are taken as paths.
pub fn find_on_path(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let full = dir.join(binary);
        if full.is_file() {
            return Some(full);
        }
        if cfg!(windows) {
            let exe = full.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}
