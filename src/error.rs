use hyper::StatusCode;
use thiserror::Error;
use tokio::time::Duration;

/// Main error type for the mirrorgate proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// No enabled, healthy mirror exists for the requested route prefix
    #[error("No upstream available for prefix '{prefix}'")]
    NoUpstream { prefix: String },

    /// Token realm unreachable, rejected our credentials, or returned garbage
    #[error("Upstream auth failure: {message}")]
    AuthFailure { message: String },

    /// Transport error talking to an upstream before any body bytes were relayed
    #[error("Upstream unavailable: {mirror}: {message}")]
    UpstreamUnavailable { mirror: String, message: String },

    /// Transport error after the response body started streaming
    #[error("Upstream stream error: {message}")]
    UpstreamMidStream { message: String },

    /// Client disconnected while we were still relaying
    #[error("Client aborted the connection")]
    ClientAbort,

    /// Malformed request path or unsupported method
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// Database errors
    #[error("Database error: {message}")]
    Database { message: String },

    /// Credential encryption/decryption errors
    #[error("Crypto error: {message}")]
    Crypto { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// Internal server errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a no-upstream error
    pub fn no_upstream<S: Into<String>>(prefix: S) -> Self {
        Self::NoUpstream {
            prefix: prefix.into(),
        }
    }

    /// Create an auth failure error
    pub fn auth_failure<S: Into<String>>(message: S) -> Self {
        Self::AuthFailure {
            message: message.into(),
        }
    }

    /// Create an upstream-unavailable error
    pub fn upstream_unavailable<M: Into<String>, S: Into<String>>(mirror: M, message: S) -> Self {
        Self::UpstreamUnavailable {
            mirror: mirror.into(),
            message: message.into(),
        }
    }

    /// Create a mid-stream error
    pub fn mid_stream<S: Into<String>>(message: S) -> Self {
        Self::UpstreamMidStream {
            message: message.into(),
        }
    }

    /// Create a bad request error
    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database<S: Into<String>>(message: S) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a crypto error
    pub fn crypto<S: Into<String>>(message: S) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the engine may fail over to the next candidate mirror.
    /// Only transport-level failures that happened before any body bytes
    /// reached the client qualify.
    pub fn is_failover(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamUnavailable { .. } | ProxyError::Timeout { .. }
        )
    }

    /// The fixed HTTP status this error maps to on the client side.
    /// Mid-stream and client-abort errors have no status; the connection
    /// is already half-written and gets closed instead.
    pub fn client_status(&self) -> StatusCode {
        match self {
            ProxyError::NoUpstream { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::AuthFailure { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Internal {
            message: format!("HTTP error: {}", err),
        }
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::Internal {
            message: format!("HTTP build error: {}", err),
        }
    }
}

impl From<hyper::http::uri::InvalidUri> for ProxyError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        ProxyError::BadRequest {
            message: format!("Invalid URI: {}", err),
        }
    }
}

impl From<sqlx::Error> for ProxyError {
    fn from(err: sqlx::Error) -> Self {
        ProxyError::Database {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Internal {
            message: format!("IO error: {}", err),
        }
    }
}

/// Result type alias for mirrorgate operations
pub type ProxyResult<T> = Result<T, ProxyError>;
