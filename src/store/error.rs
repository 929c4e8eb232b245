//! Error types for state store operations

use std::fmt;

/// Result type alias for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur against the state store
#[derive(Debug)]
pub enum StoreError {
    /// Store connection failed
    ConnectionFailed(String),

    /// A command against the store failed
    OperationFailed(String),

    /// Stored value could not be (de)serialized
    SerializationError(String),

    /// Invalid configuration
    InvalidConfig(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ConnectionFailed(msg) => {
                write!(f, "failed to connect to state store: {}", msg)
            }
            StoreError::OperationFailed(msg) => write!(f, "state store operation failed: {}", msg),
            StoreError::SerializationError(msg) => {
                write!(f, "stored value serialization error: {}", msg)
            }
            StoreError::InvalidConfig(msg) => write!(f, "invalid store configuration: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::ConnectionFailed(err.to_string())
        } else {
            StoreError::OperationFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}
