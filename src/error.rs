//! Error types for the job engine.
//!
//! Defines error types for each layer of the engine:
//! - Store I/O (connection, command and script failures)
//! - Queue operations (submission, sweeping, dequeueing, admin moves)
//! - Handler registration
//! - Worker pool lifecycle
//!
//! Handler failures are not represented here: they are `anyhow::Error`
//! values that the worker pool turns into retries or dead-letter entries.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// A Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// A server-side script failed.
    #[error("Store script failed: {0}")]
    Script(String),
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failed to serialize or deserialize job data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Submission options were rejected.
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    /// The queue name is unusable as a key prefix.
    #[error("Invalid queue name '{0}'")]
    InvalidQueueName(String),
}

impl QueueError {
    /// Returns true if the error came from decoding a stored job rather than
    /// from store I/O.
    pub fn is_corrupt_job(&self) -> bool {
        matches!(self, QueueError::Serialization(_))
    }
}

/// Errors that can occur while registering handlers.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A handler is already registered for the queue.
    #[error("Handler already registered for queue '{0}'")]
    DuplicateHandler(String),

    /// The queue name is unusable as a key prefix.
    #[error("Invalid queue name '{0}'")]
    InvalidQueueName(String),
}

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No handler is registered for the queue.
    #[error("No handler registered for queue '{0}'")]
    NoHandler(String),

    /// The queue is already being processed.
    #[error("Queue '{0}' is already being processed")]
    AlreadyRunning(String),

    /// The queue is not being processed.
    #[error("Queue '{0}' is not being processed")]
    NotRunning(String),

    /// Worker options were rejected.
    #[error("Invalid worker options: {0}")]
    InvalidOptions(String),

    /// Shutdown did not finish in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The queue could not be opened.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Rejects queue names that would collide with the key layout.
///
/// Queue names become part of `queue:{name}` keys, so they must be non-empty
/// and free of whitespace. Colons are allowed; names like `a:priority` are
/// legal but share a prefix with another queue's structures, which is the
/// caller's business.
pub(crate) fn validate_queue_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Connection("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = QueueError::InvalidOptions("max_attempts must be at least 1".to_string());
        assert!(err.to_string().contains("max_attempts"));

        let err = RegistryError::DuplicateHandler("matches".to_string());
        assert!(err.to_string().contains("matches"));

        let err = PoolError::ShutdownTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));

        let err = PoolError::NoHandler("cleanup".to_string());
        assert!(err.to_string().contains("cleanup"));
    }

    #[test]
    fn test_store_error_is_transparent_in_queue_error() {
        let err: QueueError = StoreError::Script("boom".to_string()).into();
        assert_eq!(err.to_string(), "Store script failed: boom");
        assert!(!err.is_corrupt_job());
    }

    #[test]
    fn test_corrupt_job_detection() {
        let err: QueueError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(err.is_corrupt_job());
    }

    #[test]
    fn test_validate_queue_name() {
        assert!(validate_queue_name("matches"));
        assert!(validate_queue_name("notifications:push"));
        assert!(!validate_queue_name(""));
        assert!(!validate_queue_name("has space"));
    }
}
