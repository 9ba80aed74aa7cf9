//! Error types for sessionreel-core

use thiserror::Error;

/// Main error type for the sessionreel-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network-level failure talking to the collector (connect, timeout, body)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Collector answered with a non-success status
    #[error("API error ({status}): {body}")]
    Status { status: u16, body: String },

    /// Body exceeds what the teardown-safe transport mode can carry
    #[error("payload of {size} bytes exceeds the {limit} byte limit for unloading delivery")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Session record storage error
    #[error("session storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether retrying the same request later has a reasonable chance to succeed.
    ///
    /// Server errors, throttling and network failures are transient; client
    /// errors and oversized payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// Result type alias for sessionreel-core
pub type Result<T> = std::result::Result<T, Error>;
