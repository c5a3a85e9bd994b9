//! Delivery envelope types shared by all adapters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-message hints to the broker adapter (delivery mode, routing key,
/// partition key). Opaque to the core; each adapter reads the keys it knows.
pub type PublishOptions = serde_json::Map<String, Value>;

/// Opaque acknowledgment handle.
///
/// Only the adapter that produced a handle may interpret it; the core passes
/// it back verbatim on `ack`/`nack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryHandle(pub(crate) u64);

impl DeliveryHandle {
    /// Mint a handle from a raw tag. Adapters create handles; the core only
    /// passes them back.
    pub fn from_tag(tag: u64) -> Self {
        Self(tag)
    }

    /// The raw tag, for adapter-side bookkeeping and logs.
    pub fn tag(&self) -> u64 {
        self.0
    }
}

/// An incoming delivery handed to the consumer callback.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Stable message identifier carried in broker-level metadata, so
    /// redelivered duplicates keep the same id.
    pub message_id: String,
    /// Topic the message was published to.
    pub topic: String,
    /// Decoded JSON payload.
    pub payload: Value,
    /// Acknowledgment handle for this delivery.
    pub handle: DeliveryHandle,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
}
