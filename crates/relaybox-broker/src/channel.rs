//! In-process topic broker over tokio primitives.
//!
//! Per-topic FIFO queues, at-least-once delivery, and explicit ack/nack via
//! opaque tags. Durable for the process lifetime only; its role is tests and
//! single-process deployments where the outbox still provides crash safety.

use crate::{BrokerAdapter, BrokerError, BrokerResult, ConsumeCallback, DeliveryHandle, Envelope};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;
use tracing::{debug, warn};

/// How long an idle consume loop waits before re-checking its queues.
const IDLE_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct StoredDelivery {
    message_id: String,
    topic: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, VecDeque<StoredDelivery>>>,
    in_flight: Mutex<HashMap<u64, StoredDelivery>>,
    notify: Notify,
    closed: AtomicBool,
    next_tag: AtomicU64,
}

/// In-process topic broker.
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    shared: Arc<Shared>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of undelivered messages buffered for a topic.
    pub async fn pending_count(&self, topic: &str) -> usize {
        self.shared
            .queues
            .lock()
            .await
            .get(topic)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn pop_delivery(&self, topics: &[String]) -> Option<StoredDelivery> {
        let mut queues = self.shared.queues.lock().await;
        for topic in topics {
            if let Some(delivery) = queues.get_mut(topic).and_then(VecDeque::pop_front) {
                return Some(delivery);
            }
        }
        None
    }
}

#[async_trait]
impl BrokerAdapter for ChannelBroker {
    async fn send(
        &self,
        topic: &str,
        payload: &[u8],
        message_id: &str,
        _options: &crate::PublishOptions,
    ) -> BrokerResult<bool> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let delivery = StoredDelivery {
            message_id: message_id.to_string(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
            redelivered: false,
        };

        let mut queues = self.shared.queues.lock().await;
        queues.entry(topic.to_string()).or_default().push_back(delivery);
        drop(queues);

        self.shared.notify.notify_waiters();
        debug!(topic = %topic, message_id = %message_id, "Message enqueued");
        Ok(true)
    }

    async fn consume(&self, topics: &[String], callback: ConsumeCallback) -> BrokerResult<()> {
        debug!(topics = ?topics, "Consume loop started");

        loop {
            if self.is_closed() {
                debug!("Consume loop stopped: broker closed");
                return Ok(());
            }

            let delivery = match self.pop_delivery(topics).await {
                Some(delivery) => delivery,
                None => {
                    // Bounded wait so a wakeup lost between the queue check
                    // and this await cannot hang the loop.
                    let _ =
                        tokio::time::timeout(IDLE_POLL, self.shared.notify.notified()).await;
                    continue;
                }
            };

            let payload = match serde_json::from_slice(&delivery.payload) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        message_id = %delivery.message_id,
                        topic = %delivery.topic,
                        error = %e,
                        "Dropping undecodable delivery"
                    );
                    continue;
                }
            };

            let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);
            let handle = DeliveryHandle(tag);
            let envelope = Envelope {
                message_id: delivery.message_id.clone(),
                topic: delivery.topic.clone(),
                payload,
                handle,
                redelivered: delivery.redelivered,
            };

            self.shared.in_flight.lock().await.insert(tag, delivery);

            let result = if callback(envelope) {
                self.ack(handle).await
            } else {
                self.nack(handle, false).await
            };
            match result {
                Ok(()) => {}
                // The callback may ack or nack its own handle; a handle that
                // is already settled is not a loop failure.
                Err(BrokerError::UnknownHandle(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    async fn ack(&self, handle: DeliveryHandle) -> BrokerResult<()> {
        let mut in_flight = self.shared.in_flight.lock().await;
        match in_flight.remove(&handle.0) {
            Some(delivery) => {
                debug!(message_id = %delivery.message_id, tag = handle.0, "Delivery acked");
                Ok(())
            }
            None => Err(BrokerError::UnknownHandle(handle.0)),
        }
    }

    async fn nack(&self, handle: DeliveryHandle, requeue: bool) -> BrokerResult<()> {
        let mut in_flight = self.shared.in_flight.lock().await;
        let mut delivery = in_flight
            .remove(&handle.0)
            .ok_or(BrokerError::UnknownHandle(handle.0))?;
        drop(in_flight);

        if requeue {
            delivery.redelivered = true;
            let topic = delivery.topic.clone();
            let mut queues = self.shared.queues.lock().await;
            queues.entry(topic).or_default().push_back(delivery);
            drop(queues);
            self.shared.notify.notify_waiters();
        } else {
            debug!(message_id = %delivery.message_id, tag = handle.0, "Delivery dropped");
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        debug!("Channel broker closed");
        Ok(())
    }
}
