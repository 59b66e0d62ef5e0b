//! Error types for the worker.

use std::path::PathBuf;

use revcache_net::NetError;
use revcache_store::StoreError;
use thiserror::Error;

/// Result type alias for worker operations.
pub type SwResult<T> = Result<T, SwError>;

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),

    #[error("Invalid route pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Message error: {0}")]
    Message(#[from] serde_json::Error),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Bad precache response for {url}: status {status}")]
    BadPrecacheResponse { url: String, status: u16 },

    #[error("State error: {0}")]
    State(String),
}

impl SwError {
    pub(crate) fn invalid_url(url: &str, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
