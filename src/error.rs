//! Error handling for the pool coordinator
//!
//! One error type covers wire-format problems, pool policy violations, upstream
//! chain-daemon failures and transport errors. Each variant knows whether it is
//! worth retrying and which HTTP status it maps to when surfaced to a client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for pool coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the pool coordinator
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Malformed binary or JSON input
    #[error("Format error: {message}")]
    Format { message: String },

    /// Input that is well formed but violates pool policy
    #[error("Policy violation: {message}")]
    Policy { message: String },

    /// Required state has not been loaded yet
    #[error("Not ready: {message}")]
    NotReady { message: String },

    /// Chain daemon RPC failures
    #[error("Chain daemon error: {message}")]
    Upstream { message: String },

    /// Chain daemon refused a block
    #[error("Block rejected: {message}")]
    Rejected { message: String },

    /// Another submitter already delivered the same block
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Broken invariants and malformed pool-owned data
    #[error("Fatal error: {message}")]
    Fatal { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Network errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Cancellation errors for async operations
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a format error
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a policy violation
    pub fn policy(message: impl Into<String>) -> Self {
        Self::Policy {
            message: message.into(),
        }
    }

    /// Create a not-ready error
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady {
            message: message.into(),
        }
    }

    /// Create an upstream (chain daemon) error
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Create a block rejection error
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => e.status().map_or(true, |status| {
                status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }),
            Error::Network { .. } => true,
            Error::Timeout { .. } => true,
            Error::Upstream { .. } => true,
            Error::NotReady { .. } => true,
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
            Error::Config { .. } => "config",
            Error::Format { .. } => "format",
            Error::Policy { .. } => "policy",
            Error::NotReady { .. } => "not_ready",
            Error::Upstream { .. } => "upstream",
            Error::Rejected { .. } => "rejected",
            Error::Conflict { .. } => "conflict",
            Error::Fatal { .. } => "fatal",
            Error::Timeout { .. } => "timeout",
            Error::Network { .. } => "network",
            Error::Cancelled { .. } => "cancelled",
        }
    }

    /// HTTP status used when this error ends a client request
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Format { .. } | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Policy { .. } | Error::Rejected { .. } => StatusCode::BAD_REQUEST,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
