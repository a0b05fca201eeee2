//! Error types for the tally counting pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while recording, flushing or delivering counts.
#[derive(Error, Debug)]
pub enum Error {
    /// The counting store could not be reached or rejected a command.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The downstream queue could not be reached or refused a publish.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A single callback endpoint could not be notified.
    #[error("notify to {url} failed: {reason}")]
    NotifyFailure {
        /// The endpoint that was being notified.
        url: String,
        /// Transport error or unexpected status.
        reason: String,
    },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::QueueUnavailable(err.to_string())
    }
}

impl From<bb8_redis::redis::RedisError> for Error {
    fn from(err: bb8_redis::redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<bb8_redis::bb8::RunError<bb8_redis::redis::RedisError>> for Error {
    fn from(err: bb8_redis::bb8::RunError<bb8_redis::redis::RedisError>) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}
