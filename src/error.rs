//! Error types for the Floodgate limiter.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy document could not be parsed or built
    #[error("Policy error: {0}")]
    Policy(String),

    /// Policy source answered, but not with a usable document
    #[error("Policy fetch error: {0}")]
    Fetch(String),

    /// HTTP transport errors while talking to the policy source
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Metric registration or encoding errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
