//! Typed error hierarchy for pump-dl
//!
//! Every error type carries enough context to tell what went wrong and
//! whether the attempt that produced it may be retried.

use crate::protocol::PumpingId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download queue
#[derive(Debug, Error)]
pub enum PumpError {
    /// Malformed or unsupported URL, rejected at `add` time
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Transient network or HTTP failure
    #[error("Connection error: {message}")]
    Connection {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Redirect chain longer than the configured bound
    #[error("Redirect loop: more than {limit} redirects starting at {url}")]
    RedirectLoop { url: String, limit: usize },

    /// Declared and actual byte counts disagree
    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// Cooperative cancellation observed mid-attempt
    #[error("Transfer cancelled")]
    Cancelled,

    /// Storage/filesystem errors, including the persisted queue file
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Server behaviour the engine cannot work with
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Pumping not found
    #[error("Pumping not found: {0}")]
    NotFound(PumpingId),

    /// Invalid state transition or operation
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Invalid configuration or argument
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkErrorKind {
    /// DNS resolution or connect failed
    Connect,
    /// Connection or read timeout
    Timeout,
    /// Server returned a non-success status
    HttpStatus(u16),
    /// Body stream broke or ended early
    Stream,
    /// Redirect without a usable Location header
    BadRedirect,
    /// Other network error
    Other,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Path is outside the download directory
    PathTraversal,
    /// Persisted queue file could not be parsed
    Corrupt,
    /// I/O error
    Io,
}

/// Category of the last error recorded on a pumping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidUrl,
    Connection,
    RedirectLoop,
    LengthMismatch,
    Cancelled,
    Storage,
    Protocol,
    Internal,
}

/// Serializable form of an error, kept on the pumping as its last error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpingFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for PumpingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl PumpError {
    /// Check if this error is retryable within the attempt budget
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Create a connection error
    pub fn connection(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Connection {
            kind,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an I/O storage error for a path
    pub fn io(path: impl Into<PathBuf>, context: &str, err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        Self::storage(kind, path, format!("{}: {}", context, err))
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid URL error
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Category used when this error becomes a pumping's last error
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::InvalidUrl { .. } => FailureKind::InvalidUrl,
            Self::Connection { .. } => FailureKind::Connection,
            Self::RedirectLoop { .. } => FailureKind::RedirectLoop,
            Self::LengthMismatch { .. } => FailureKind::LengthMismatch,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Storage { .. } => FailureKind::Storage,
            Self::Protocol { .. } => FailureKind::Protocol,
            Self::NotFound(_)
            | Self::InvalidState { .. }
            | Self::InvalidInput { .. }
            | Self::Internal(_) => FailureKind::Internal,
        }
    }

    /// Snapshot of this error for storing on a pumping
    pub fn to_failure(&self) -> PumpingFailure {
        PumpingFailure {
            kind: self.failure_kind(),
            message: self.to_string(),
        }
    }
}

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, PumpError>;

impl From<std::io::Error> for PumpError {
    fn from(err: std::io::Error) -> Self {
        Self::io(PathBuf::new(), "I/O error", err)
    }
}

impl From<reqwest::Error> for PumpError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::Connect
        } else if let Some(status) = err.status() {
            NetworkErrorKind::HttpStatus(status.as_u16())
        } else if err.is_body() || err.is_decode() {
            NetworkErrorKind::Stream
        } else {
            NetworkErrorKind::Other
        };

        Self::Connection {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for PumpError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl {
            url: String::new(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PumpError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage(
            StorageErrorKind::Corrupt,
            PathBuf::new(),
            format!("JSON error: {}", err),
        )
    }
}
