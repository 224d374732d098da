//! URL utilities for consistent endpoint construction.

/// Normalize a base URL by removing trailing slashes
///
/// # Examples
///
/// ```
/// use localbridge::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://relay.example.com/"), "https://relay.example.com");
/// assert_eq!(normalize_base_url("http://127.0.0.1:11434///"), "http://127.0.0.1:11434");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete endpoint URL from a base URL and a path
///
/// # Examples
///
/// ```
/// use localbridge::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("http://127.0.0.1:11434/", "/api/chat"),
///     "http://127.0.0.1:11434/api/chat"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Build the relay bridge socket URL, switching the scheme to `ws`/`wss`.
///
/// ```
/// use localbridge::utils::url::bridge_socket_url;
///
/// assert_eq!(
///     bridge_socket_url("https://relay.example.com/", "abc"),
///     "wss://relay.example.com/ws/bridge?token=abc"
/// );
/// ```
pub fn bridge_socket_url(base_url: &str, token: &str) -> String {
    let normalized = normalize_base_url(base_url);
    let socket_base = if let Some(rest) = normalized.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = normalized.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if normalized.starts_with("ws://") || normalized.starts_with("wss://") {
        normalized
    } else {
        format!("wss://{normalized}")
    };
    format!("{socket_base}/ws/bridge?token={}", encode_query_value(token))
}

/// Map a local backend path onto the relay's proxy surface.
///
/// `/api/version` becomes the relay status endpoint; every other `/api/...`
/// path is served under `/api/ollama`.
pub fn relay_proxy_path(local_path: &str) -> String {
    let path = format!("/{}", local_path.trim_start_matches('/'));
    if path == "/api/version" {
        return "/api/proxy/status".to_string();
    }
    if path.starts_with("/api/") {
        return format!("/api/ollama{path}");
    }
    path
}

/// Host and port of an `http(s)://host:port/...` URL. The port defaults to
/// the scheme's well-known port.
pub fn host_and_port(url: &str) -> Option<(String, u16)> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.is_empty() {
        return None;
    }
    let default_port = match scheme {
        "https" | "wss" => 443,
        _ => 80,
    };
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => Some((authority.to_string(), default_port)),
    }
}

fn encode_query_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}
