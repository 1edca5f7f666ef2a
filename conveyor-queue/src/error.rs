//! Error types for queue operations.

use conveyor_redis::RedisError;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Missing or invalid manager configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Submission to a queue that was never created
    #[error("Queue {0} not found. Create it first using create_queue()")]
    QueueNotFound(String),

    /// A processor asked to move a job into an unregistered queue
    #[error("Target queue {0} not found for redirection")]
    RedirectTargetNotFound(String),

    /// The job processor failed
    #[error("Job processing failed: {0}")]
    Processing(String),

    /// The queue handle was closed
    #[error("Queue {0} is closed")]
    QueueClosed(String),

    /// The queue holds its maximum number of pending jobs
    #[error("Queue {0} is full")]
    QueueFull(String),

    /// The shared connection was closed
    #[error("Connection is closed")]
    ConnectionClosed,

    /// `run()` was called on a running worker
    #[error("Worker for queue {0} is already running")]
    WorkerAlreadyRunning(String),

    /// `run()` was called on a closed worker
    #[error("Worker for queue {0} is closed")]
    WorkerClosed(String),

    /// Engine connection or command error
    #[error("Redis error: {0}")]
    Redis(#[source] RedisError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl QueueError {
    /// Shorthand for a processing failure.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }
}

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        match err {
            RedisError::Closed => Self::ConnectionClosed,
            other => Self::Redis(other),
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(RedisError::from(err))
    }
}
