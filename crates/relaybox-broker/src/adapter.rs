//! The uniform broker interface the core depends on.

use crate::{BrokerResult, DeliveryHandle, Envelope, PublishOptions};
use async_trait::async_trait;
use std::sync::Arc;

/// Consumer callback invoked once per incoming delivery.
///
/// Returning true acknowledges the delivery; false negatively acknowledges
/// it. The callback runs on the adapter's consume task and may block it for
/// the duration of one message.
pub type ConsumeCallback = Arc<dyn Fn(Envelope) -> bool + Send + Sync>;

/// Uniform surface over concrete brokers (AMQP-style topic brokers,
/// partitioned log brokers, the in-process channel broker).
///
/// All operations must be safe under concurrent calls; adapter instances
/// are shared across workers.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Best-effort synchronous publish.
    ///
    /// Returns `Ok(false)` when the broker refused the message or the
    /// round-trip timed out — a timeout is never a silent success. Transport
    /// errors are `Err`.
    async fn send(
        &self,
        topic: &str,
        payload: &[u8],
        message_id: &str,
        options: &PublishOptions,
    ) -> BrokerResult<bool>;

    /// Blocking subscription over the given topics.
    ///
    /// Invokes `callback` for each delivery; its boolean return decides
    /// ack vs nack. Runs until the adapter is closed — `close()` is the
    /// cancellation primitive.
    async fn consume(&self, topics: &[String], callback: ConsumeCallback) -> BrokerResult<()>;

    /// Acknowledge a delivery.
    async fn ack(&self, handle: DeliveryHandle) -> BrokerResult<()>;

    /// Negatively acknowledge a delivery. With `requeue` the message is
    /// eventually redelivered; without, it is dropped (the consumption
    /// ledger owns the failure record).
    async fn nack(&self, handle: DeliveryHandle, requeue: bool) -> BrokerResult<()>;

    /// Release underlying resources and wake consume loops. Idempotent.
    async fn close(&self) -> BrokerResult<()>;
}
