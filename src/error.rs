//! Error types for upstamp

use crate::types::UploadId;
use thiserror::Error;

/// Result type alias for upstamp operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for upstamp
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (reading sources, config files)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Network errors (HTTP, connection issues)
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Proof creation, lookup or attachment failed
    #[error("Proof error: {message}")]
    Proof { message: String },

    /// Proof artifact bytes are malformed or use unsupported operations
    #[error("Malformed proof: {message}")]
    ProofFormat { message: String },

    /// A display name that cannot be turned into a target URL
    #[error("Invalid target {name}: {reason}")]
    InvalidTarget { name: String, reason: String },

    /// Retry requested for an upload that is not in the failed set
    #[error("Upload {id} is not failed")]
    NotFailed { id: UploadId },

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The scheduler task is gone
    #[error("Upload scheduler is not running")]
    SchedulerClosed,
}

impl Error {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a network error without an underlying client error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a proof error
    pub fn proof(message: impl Into<String>) -> Self {
        Self::Proof {
            message: message.into(),
        }
    }

    /// Create a proof format error
    pub fn proof_format(message: impl Into<String>) -> Self {
        Self::ProofFormat {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } => true,
            Error::Io { source, .. } => {
                use std::io::ErrorKind;
                matches!(
                    source.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Config {
            message: format!("invalid URL: {}", err),
        }
    }
}
