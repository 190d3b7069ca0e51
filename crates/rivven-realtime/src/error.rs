//! Error types for real-time replication
//!
//! Only transport, storage, feed and configuration failures end a run.
//! Malformed fields, missing records and feed gaps are absorbed where they
//! occur and never reach the caller as errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source API failures (auth, network, HTTP status)
    Transport,
    /// Row or field level data problems
    Data,
    /// Local fingerprint or checkpoint storage
    Storage,
    /// Change feed subscription failures
    Feed,
    /// Invalid configuration or schema
    Config,
    /// Everything else
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Data => "data",
            Self::Storage => "storage",
            Self::Feed => "feed",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Replication errors
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Source API answered with a failure status or could not be reached
    #[error("Transport error{}: {message}", http_status(.status))]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Query response could not be interpreted
    #[error("Query error: {0}")]
    Query(String),

    /// Fingerprint store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Change feed failure
    #[error("Feed error: {0}")]
    Feed(String),

    /// Schema cannot drive replication (e.g. no key property)
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// Checkpoint could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single property failed coercion
    #[error("Projection error on '{property}': {message}")]
    Projection { property: String, message: String },

    /// The downstream consumer went away
    #[error("Output channel closed")]
    OutputClosed,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn feed(msg: impl Into<String>) -> Self {
        Self::Feed(msg.into())
    }

    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        Self::InvalidSchema(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn projection(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Projection {
            property: property.into(),
            message: message.into(),
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport { .. } | Self::Http(_) | Self::Query(_) => ErrorCategory::Transport,
            Self::Projection { .. } | Self::Json(_) => ErrorCategory::Data,
            Self::Store(_) | Self::Checkpoint(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Feed(_) => ErrorCategory::Feed,
            Self::InvalidSchema(_) | Self::Config(_) => ErrorCategory::Config,
            Self::OutputClosed => ErrorCategory::Internal,
        }
    }

    /// Whether this error terminates a replication run.
    ///
    /// Projection errors are the only class recovered in place.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Projection { .. })
    }

    /// Whether a caller may reasonably retry the whole run.
    ///
    /// The engine itself never retries; this is a hint for supervisors.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport { status, .. } => match status {
                Some(code) => *code == 429 || *code >= 500,
                None => true,
            },
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Feed(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }

    /// Stable error code for structured logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport_failed",
            Self::Http(_) => "http_failed",
            Self::Query(_) => "query_failed",
            Self::Store(_) => "store_failed",
            Self::Feed(_) => "feed_failed",
            Self::InvalidSchema(_) => "invalid_schema",
            Self::Checkpoint(_) => "checkpoint_failed",
            Self::Config(_) => "config_invalid",
            Self::Projection { .. } => "field_malformed",
            Self::OutputClosed => "output_closed",
            Self::Json(_) => "json_invalid",
            Self::Io(_) => "io_failed",
        }
    }
}

fn http_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;
