//! Error types for the bridge.
//!
//! Uses `thiserror` for structured error handling with automatic `From`
//! implementations. The taxonomy mirrors the propagation policy: backend
//! JSON-RPC errors are relayed verbatim; everything here covers the cases
//! where no faithful answer exists.

use crate::protocol::RpcError;

/// Errors from the transport layer (child stdio, SSE, streamable HTTP).
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// Failed to spawn or talk to a child process.
    #[error("process error: {0}")]
    Process(#[from] std::io::Error),

    /// HTTP transport error (connection, DNS, TLS, reset).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with an unexpected status.
    #[error("unexpected status {status} from {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Upstream URL.
        url: String,
    },

    /// Upstream signalled end-of-session; a re-initialize may recover it.
    #[error("upstream terminated the session at {url}")]
    SessionTerminated {
        /// Upstream URL.
        url: String,
    },

    /// The SSE stream ended before the `endpoint` event arrived.
    #[error("SSE stream from {url} ended before the endpoint event")]
    NoEndpoint {
        /// Upstream URL.
        url: String,
    },

    /// Invalid or unresolvable URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The transport channel is closed; the peer is gone.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    #[must_use]
    pub fn status(status: u16, url: impl Into<String>) -> Self {
        Self::Status { status, url: url.into() }
    }

    /// HTTP status carried by this error, when there is one.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// True when a single re-initialize + reissue may recover the session:
    /// connection reset, 404 after an idle recycle, or an explicit
    /// session-terminated signal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SessionTerminated { .. } => true,
            Self::Status { status, .. } => *status == 404 || *status >= 500,
            Self::Http(e) => e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// Errors from a `ClientSession` operation.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer answered with a JSON-RPC error. Relayed verbatim upstream.
    #[error("{0}")]
    Rpc(RpcError),

    /// No response within the request budget. No cancellation is sent; a
    /// late answer will be dropped.
    #[error("request timed out after {seconds}s")]
    Timeout {
        /// Budget that elapsed.
        seconds: u64,
    },

    /// The session closed while the request was in flight.
    #[error("session closed")]
    Closed,

    /// The caller cancelled the request; no response is owed to anyone.
    #[error("request cancelled")]
    Cancelled,

    /// The initialize handshake failed.
    #[error("initialize handshake failed: {0}")]
    Handshake(String),
}

impl SessionError {
    /// The JSON-RPC error to put on the wire for a frontend, given the name
    /// of the backend this session talks to. Backend errors pass through
    /// unchanged; synthetic errors name the server.
    #[must_use]
    pub fn into_rpc_error(self, server: &str) -> RpcError {
        match self {
            Self::Rpc(e) => e,
            Self::Timeout { .. } => RpcError::timeout(server),
            Self::Transport(t) => {
                let mut err = RpcError::backend_unavailable(server, t.to_string());
                if let (Some(status), Some(data)) = (t.http_status(), err.data.as_mut()) {
                    data["upstream_status"] = status.into();
                }
                err
            }
            other => RpcError::backend_unavailable(server, other.to_string()),
        }
    }
}

/// Configuration problems. All of these exit the process with code 1.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("server '{name}': {reason}")]
    Server { name: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    #[must_use]
    pub fn json(path: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json { path: path.into(), source }
    }

    #[must_use]
    pub fn server(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Server { name: name.into(), reason: reason.into() }
    }
}

/// Bridge-level failures that are not tied to a single request.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Two backends produced the same aggregated name under `error` policy.
    #[error("name collision on '{name}' between '{first}' and '{second}'")]
    NameCollision { name: String, first: String, second: String },

    /// No port in the probed range could be bound.
    #[error("no free port in {start}..={end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("server '{0}' not found")]
    UnknownServer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
