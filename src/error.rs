//! Error types.

use thiserror::Error;

use crate::config::ConfigError;

/// An event rejected before it reaches a stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("spend_currency is required for economy events")]
    MissingSpendCurrency,

    #[error("spend_amount is required for economy events")]
    MissingSpendAmount,

    #[error("log_line is required")]
    EmptyLogLine,
}

/// A single delivery attempt that never produced an HTTP status.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Request exceeded the configured timeout
    #[error("request timed out")]
    Timeout,

    /// Connection or protocol failure
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The batch could not be turned into wire bytes
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Anything else, e.g. a transport implementation that gave up
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err)
        }
    }
}

/// Queue file read/write failure.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client construction and usage errors.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("client must be built inside a tokio runtime")]
    NoRuntime,

    #[error("client already initialized")]
    AlreadyInitialized,

    #[error("client not initialized")]
    NotInitialized,

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to start stream worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
