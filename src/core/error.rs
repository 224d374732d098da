//! Error taxonomy shared by the transports, the broker and the streaming layer.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Coarse classification used for retry decisions and for choosing which
/// error to surface in the aggregate connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Refused, unreachable, timed out. Retryable.
    Connectivity,
    /// Missing or rejected bearer token. Surfaced, not retried by the transport.
    Authentication,
    /// Malformed bridge message, broken socket, undecodable payload.
    Protocol,
    /// Attempts suppressed by policy (open circuit, unsupported platform).
    Capacity,
}

#[derive(Debug, Clone)]
pub enum TransportError {
    /// The endpoint could not be reached.
    Connectivity(String),
    /// A network call exceeded its configured deadline.
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// No token is available, or the remote side rejected it.
    Authentication(String),
    /// The remote side answered with a non-success HTTP status.
    Http { status: u16, body: String },
    /// The peer sent something we could not understand, or the socket broke.
    Protocol(String),
    /// The circuit breaker is open; the next probe is allowed after `retry_in`.
    CircuitOpen { retry_in: Duration },
    /// The transport cannot run on this platform.
    Unsupported(String),
    /// The transport was shut down while the call was in flight.
    Closed,
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Connectivity(_) | TransportError::Timeout { .. } => {
                ErrorKind::Connectivity
            }
            TransportError::Authentication(_) => ErrorKind::Authentication,
            TransportError::Http { status, .. } if *status == 401 || *status == 403 => {
                ErrorKind::Authentication
            }
            TransportError::Http { .. } => ErrorKind::Connectivity,
            TransportError::Protocol(_) | TransportError::Closed => ErrorKind::Protocol,
            TransportError::CircuitOpen { .. } | TransportError::Unsupported(_) => {
                ErrorKind::Capacity
            }
        }
    }

    /// Whether the failure should be fed into the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connectivity | ErrorKind::Protocol)
            && !matches!(self, TransportError::Closed)
    }

    pub fn is_authentication(&self) -> bool {
        self.kind() == ErrorKind::Authentication
    }

    /// Whether a failure seen mid-stream says something about the transport
    /// itself. Client errors such as an unknown model do not.
    pub fn is_link_failure(&self) -> bool {
        match self {
            TransportError::Http { status, .. } => *status >= 500 || self.is_authentication(),
            TransportError::CircuitOpen { .. } | TransportError::Unsupported(_) => false,
            _ => true,
        }
    }

    /// Maps a reqwest failure onto the taxonomy. `operation` names the call for
    /// timeout reporting.
    pub fn from_reqwest(err: reqwest::Error, operation: &'static str, after: Duration) -> Self {
        if err.is_timeout() {
            return TransportError::Timeout { operation, after };
        }
        if let Some(status) = err.status() {
            return TransportError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        if err.is_decode() {
            return TransportError::Protocol(err.to_string());
        }
        TransportError::Connectivity(err.to_string())
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connectivity(message) => write!(f, "Connection failed: {message}"),
            TransportError::Timeout { operation, after } => {
                write!(f, "{operation} timed out after {}ms", after.as_millis())
            }
            TransportError::Authentication(message) => {
                write!(f, "Authentication failed: {message}")
            }
            TransportError::Http { status, body } => {
                let body = body.trim();
                if body.is_empty() {
                    write!(f, "HTTP {status}")
                } else {
                    write!(f, "HTTP {status}: {body}")
                }
            }
            TransportError::Protocol(message) => write!(f, "Protocol error: {message}"),
            TransportError::CircuitOpen { retry_in } => write!(
                f,
                "Circuit open; next attempt allowed in {}s",
                retry_in.as_secs()
            ),
            TransportError::Unsupported(message) => write!(f, "Unsupported: {message}"),
            TransportError::Closed => write!(f, "Transport closed"),
        }
    }
}

impl StdError for TransportError {}

/// Failures at the session API boundary. Per-call transport failures are not
/// reported here; they arrive as terminal stream events.
#[derive(Debug)]
pub enum SessionError {
    /// `stream()` was called on a broker that has no transports at all.
    NoTransportsConfigured,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NoTransportsConfigured => {
                write!(f, "No transports are configured; enable at least one in the config")
            }
        }
    }
}

impl StdError for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_auth_statuses_classify_as_authentication() {
        let unauthorized = TransportError::Http {
            status: 401,
            body: String::new(),
        };
        let forbidden = TransportError::Http {
            status: 403,
            body: "nope".to_string(),
        };
        let server = TransportError::Http {
            status: 503,
            body: String::new(),
        };

        assert_eq!(unauthorized.kind(), ErrorKind::Authentication);
        assert_eq!(forbidden.kind(), ErrorKind::Authentication);
        assert_eq!(server.kind(), ErrorKind::Connectivity);
        assert!(server.is_retryable());
        assert!(!unauthorized.is_retryable());
    }

    #[test]
    fn capacity_errors_are_not_retryable() {
        let open = TransportError::CircuitOpen {
            retry_in: Duration::from_secs(30),
        };
        assert_eq!(open.kind(), ErrorKind::Capacity);
        assert!(!open.is_retryable());
        assert!(!TransportError::Closed.is_retryable());
    }

    #[test]
    fn client_errors_are_not_link_failures() {
        let missing_model = TransportError::Http {
            status: 404,
            body: r#"{"error":"model not found"}"#.to_string(),
        };
        let bad_gateway = TransportError::Http {
            status: 502,
            body: String::new(),
        };
        assert!(!missing_model.is_link_failure());
        assert!(bad_gateway.is_link_failure());
        assert!(TransportError::Connectivity("reset".into()).is_link_failure());
    }

    #[test]
    fn display_includes_timeout_operation() {
        let err = TransportError::Timeout {
            operation: "version probe",
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "version probe timed out after 1500ms");
    }
}
