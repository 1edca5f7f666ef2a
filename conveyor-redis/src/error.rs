//! Redis connection error types.

use thiserror::Error;

/// Result type for Redis connection operations.
pub type Result<T> = std::result::Result<T, RedisError>;

/// Redis connection errors.
#[derive(Debug, Error)]
pub enum RedisError {
    /// The server could not be reached or the handshake failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command was rejected by the server.
    #[error("Command error: {0}")]
    Command(String),

    /// Invalid connection configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared connection was closed and cannot be reused.
    #[error("Connection is closed")]
    Closed,

    /// Underlying Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedisError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }

    /// Check if this error indicates connection loss.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Redis(e) => e.is_connection_refusal() || e.is_connection_dropped(),
            _ => false,
        }
    }
}
