//! Coordinator error types.

use relaybox_broker::BrokerError;
use relaybox_store::StoreError;
use thiserror::Error;

/// Coordinator error type.
///
/// Only invariant violations and store failures from `commit` reach business
/// callers; dispatcher, consumer, and scanner absorb everything else into
/// logs and persistent record state.
#[derive(Error, Debug)]
pub enum RelayError {
    /// begin() while a producer transaction is already open
    #[error("Producer already in a transaction")]
    AlreadyInTransaction,

    /// prepare()/commit() with no open producer transaction
    #[error("No producer transaction open")]
    NotInTransaction,

    /// A staged message could not be persisted; the transaction was rolled back
    #[error("Failed to save staged message {message_id}: {source}")]
    SaveFailed {
        message_id: String,
        #[source]
        source: StoreError,
    },

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker error
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using RelayError.
pub type RelayResult<T> = Result<T, RelayError>;
