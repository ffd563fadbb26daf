//! Error types for the message-queue crate
//!
//! Queue operations themselves never fail: timeouts and shutdown are reported
//! through `Option` returns and posts after quit are dropped. The errors here
//! cover the ambient surface around the queues, such as loading configuration
//! and installing the logging subscriber.

use thiserror::Error;

/// Result type alias for message-queue operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by configuration and logging setup
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O failure while reading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The global tracing subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(details: impl Into<String>) -> Self {
        Self::Config(details.into())
    }

    /// Create a new logging error
    pub fn logging(details: impl Into<String>) -> Self {
        Self::Logging(details.into())
    }
}
