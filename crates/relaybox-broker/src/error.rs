//! Broker error types.

use thiserror::Error;

/// Broker error type.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Adapter has been closed
    #[error("Broker closed")]
    Closed,

    /// Publish failure
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Subscription failure
    #[error("Consume failed: {0}")]
    Consume(String),

    /// Unknown delivery handle on ack/nack
    #[error("Unknown delivery handle: {0}")]
    UnknownHandle(u64),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using BrokerError.
pub type BrokerResult<T> = Result<T, BrokerError>;
