//! Error types.
//!
//! Nothing in the sending pipeline is fatal: a [`TransportError`] turns into
//! a failed cycle that is retried on the next interval. [`ConfigError`] only
//! surfaces from constructors, before any background worker is running.

use thiserror::Error;

/// Failures talking to the collector.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("malformed status response: {0}")]
    MalformedResponse(String),
}

/// Failures loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
