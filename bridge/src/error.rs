//! Error types for the bridge

use serde::Serialize;
use thiserror::Error;
use vahti_core::Category;

// Re-export SinkError from vahti-core
pub use vahti_core::SinkError;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Classification of a failed upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// 401/403, after any credential fallback was attempted
    Unauthorized,
    /// Call exceeded the configured timeout
    Timeout,
    /// 404
    NotFound,
    /// 5xx or an unparsable response body
    ServerError,
    /// Connection refused/reset, DNS, TLS
    NetworkError,
    /// Any other 4xx (400, 409, 429 ...)
    Rejected,
}

impl ApiErrorKind {
    /// Transient failures are the only ones retried
    pub fn is_transient(self) -> bool {
        matches!(self, ApiErrorKind::Timeout | ApiErrorKind::NetworkError)
    }

    /// Map a non-success HTTP status
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ApiErrorKind::Unauthorized,
            404 => ApiErrorKind::NotFound,
            400..=499 => ApiErrorKind::Rejected,
            _ => ApiErrorKind::ServerError,
        }
    }

    /// Short label for logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            ApiErrorKind::Unauthorized => "unauthorized",
            ApiErrorKind::Timeout => "timeout",
            ApiErrorKind::NotFound => "not_found",
            ApiErrorKind::ServerError => "server_error",
            ApiErrorKind::NetworkError => "network_error",
            ApiErrorKind::Rejected => "rejected",
        }
    }
}

/// Error returned by the upstream client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} upstream error: {message}", .kind.as_str())]
pub struct ApiError {
    /// What went wrong
    pub kind: ApiErrorKind,
    /// Detail for logs; never contains credentials
    pub message: String,
}

impl ApiError {
    /// Create a new ApiError
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a timeout
    pub fn timeout() -> Self {
        Self::new(ApiErrorKind::Timeout, "request timed out")
    }
}

/// A raw record the normalizer could not map to a canonical event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed {category} event: {reason}")]
pub struct MalformedEvent {
    /// Category whose table rejected the record
    pub category: Category,
    /// Which field was missing or unparsable
    pub reason: String,
}

impl MalformedEvent {
    /// Create a new MalformedEvent
    pub fn new(category: Category, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
        }
    }
}

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error (the only failure fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Neither credential form is configured for a category
    #[error("no usable credential for {category}")]
    AuthUnavailable { category: Category },

    /// Legacy session login failed
    #[error("session login failed: {0}")]
    AuthRefreshFailed(String),

    /// Upstream call failed
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Record skipped by the normalizer
    #[error(transparent)]
    MalformedEvent(#[from] MalformedEvent),

    /// Sink delivery failed
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Bridge is shutting down or was never started
    #[error("shutdown requested")]
    Shutdown,
}

impl BridgeError {
    /// Flat, secret-free classification for health records
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            BridgeError::AuthUnavailable { .. } => Some(ErrorKind::AuthUnavailable),
            BridgeError::AuthRefreshFailed(_) => Some(ErrorKind::AuthRefreshFailed),
            BridgeError::Api(e) => Some(ErrorKind::Api(e.kind)),
            BridgeError::MalformedEvent(_) => Some(ErrorKind::MalformedEvent),
            BridgeError::Sink(_) => Some(ErrorKind::SinkUnavailable),
            _ => None,
        }
    }
}

/// Error classification surfaced through the health snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ErrorKind {
    /// No credential configured for the category
    AuthUnavailable,
    /// Legacy login failed
    AuthRefreshFailed,
    /// Upstream call failed
    Api(ApiErrorKind),
    /// A record was skipped
    MalformedEvent,
    /// A sink delivery failed
    SinkUnavailable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::AuthUnavailable => f.write_str("auth_unavailable"),
            ErrorKind::AuthRefreshFailed => f.write_str("auth_refresh_failed"),
            ErrorKind::Api(kind) => write!(f, "api:{}", kind.as_str()),
            ErrorKind::MalformedEvent => f.write_str("malformed_event"),
            ErrorKind::SinkUnavailable => f.write_str("sink_unavailable"),
        }
    }
}
