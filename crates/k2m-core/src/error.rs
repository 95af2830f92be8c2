//! Error types for k2m core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use thiserror::Error;

/// Result type alias for k2m operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for k2m.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka-related error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Document store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Record processing error
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A background task panicked or was torn down unexpectedly
    #[error("Task failed: {0}")]
    Task(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether the error should end the whole process rather than one record
    /// or partition.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Config(_) | Error::Task(_) => true,
            Error::Kafka(e) => e.is_fatal(),
            Error::Store(e) => matches!(e, StoreError::ConnectionFailed { .. }),
            _ => false,
        }
    }
}

/// Kafka-specific errors.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Authentication or authorization rejected by the broker
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Client entered an unrecoverable state
    #[error("Fatal broker error: {0}")]
    Fatal(String),

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Poll failed
    #[error("Poll failed: {0}")]
    Poll(String),

    /// Offset commit failed
    #[error("Offset commit failed: {0}")]
    OffsetCommit(String),

    /// Partition assignment error
    #[error("Partition assignment error: {0}")]
    PartitionAssignment(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transient failures kept recurring past the retry budget
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Consumer closed
    #[error("Consumer closed")]
    ConsumerClosed,
}

impl KafkaError {
    /// Fatal broker errors end the run; everything else is retried with
    /// backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KafkaError::ConnectionFailed { .. }
                | KafkaError::Authentication(_)
                | KafkaError::Fatal(_)
                | KafkaError::RetriesExhausted { .. }
                | KafkaError::ConsumerClosed
        )
    }
}

/// Document store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Could not reach the store at startup
    #[error("Connection failed to {target}: {message}")]
    ConnectionFailed { target: String, message: String },

    /// Write did not complete before its deadline
    #[error("Write timed out after {0}ms")]
    Timeout(u64),

    /// Network or server-selection failure
    #[error("Network error: {0}")]
    Network(String),

    /// Document already exists under the same id
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Store rejected the document
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// Operation cancelled by shutdown or revocation
    #[error("Write cancelled")]
    Cancelled,

    /// Handle already released
    #[error("Store closed")]
    Closed,
}

impl StoreError {
    /// Retryable store errors become `ProcessingOutcome::Retryable`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::Network(_) | StoreError::Cancelled
        )
    }
}

/// Errors raised while handling a single record.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Sink write failed
    #[error("Sink write failed: {0}")]
    Sink(#[from] StoreError),

    /// Record could not be turned into a document
    #[error("Transform failed: {0}")]
    Transform(String),

    /// `handle` did not return before the processing timeout
    #[error("Processing timed out after {0}ms")]
    Timeout(u64),

    /// Dead-letter write failed
    #[error("Dead letter write failed: {0}")]
    DeadLetter(String),

    /// Processor panicked
    #[error("Processor panicked: {0}")]
    Panicked(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let kafka_err = KafkaError::ConnectionFailed {
            broker: "localhost:9092".into(),
            message: "connection refused".into(),
        };
        let err: Error = kafka_err.into();
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_kafka_error_classification() {
        assert!(KafkaError::Authentication("bad sasl".into()).is_fatal());
        assert!(KafkaError::Fatal("fenced".into()).is_fatal());
        assert!(KafkaError::RetriesExhausted {
            attempts: 10,
            last_error: "broker down".into()
        }
        .is_fatal());
        assert!(!KafkaError::Poll("transport".into()).is_fatal());
        assert!(!KafkaError::OffsetCommit("coordinator moved".into()).is_fatal());
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Timeout(500).is_retryable());
        assert!(StoreError::Network("reset".into()).is_retryable());
        assert!(!StoreError::Rejected("document too large".into()).is_retryable());
        assert!(!StoreError::DuplicateKey("t:0:5".into()).is_retryable());
    }

    #[test]
    fn test_top_level_fatality() {
        assert!(Error::Config("missing".into()).is_fatal());
        assert!(Error::Store(StoreError::ConnectionFailed {
            target: "mongodb://db".into(),
            message: "refused".into()
        })
        .is_fatal());
        assert!(!Error::Store(StoreError::Timeout(10)).is_fatal());
        assert!(!Error::Processing(ProcessingError::Timeout(10)).is_fatal());
    }

    #[test]
    fn test_processing_error_from_store() {
        let err: ProcessingError = StoreError::Timeout(250).into();
        assert_eq!(err.to_string(), "Sink write failed: Write timed out after 250ms");
    }
}
