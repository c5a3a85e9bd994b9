//! Dispatcher: drain pending outbox rows into the broker with bounded retry.

use crate::{DispatcherConfig, RelayResult};
use relaybox_broker::{BrokerAdapter, PublishOptions};
use relaybox_store::{OutboxMessage, OutboxStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Error text recorded when a message exhausts its publish attempts.
const MAX_RETRY_ERROR: &str = "max retry exceeded";

/// Outbox dispatcher worker.
///
/// Delivery is at-least-once: a message can be published twice if marking it
/// sent fails after a successful publish, or if two dispatcher instances
/// race on the same row. Consumers deduplicate through the idempotency
/// ledger.
pub struct Dispatcher {
    outbox: OutboxStore,
    broker: Arc<dyn BrokerAdapter>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(outbox: OutboxStore, broker: Arc<dyn BrokerAdapter>, config: DispatcherConfig) -> Self {
        Self {
            outbox,
            broker,
            config,
        }
    }

    /// Drain one batch of pending messages, oldest first.
    ///
    /// Returns the number of messages published. Individual record failures
    /// never abort the batch: a refused publish feeds the retry counter (or
    /// the terminal failed state once `max_retry` is reached), and store
    /// failures on a single record are logged and left for the next cycle.
    pub async fn dispatch_once(&self) -> RelayResult<usize> {
        let batch = self.outbox.fetch_pending(self.config.batch_size)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        for message in &batch {
            if self.dispatch_one(message).await {
                sent += 1;
            }
        }

        debug!(batch = batch.len(), sent, "Dispatch cycle complete");
        Ok(sent)
    }

    /// Publish a single message; true if the broker accepted it.
    async fn dispatch_one(&self, message: &OutboxMessage) -> bool {
        let options = match decode_options(message.options.as_deref()) {
            Ok(options) => options,
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Undecodable options, counting as failed attempt"
                );
                self.record_failure(message);
                return false;
            }
        };

        let result = self
            .broker
            .send(
                &message.topic,
                message.payload.as_bytes(),
                &message.message_id,
                &options,
            )
            .await;

        match result {
            Ok(true) => {
                match self.outbox.mark_sent(&message.message_id) {
                    Ok(true) => {}
                    Ok(false) => {
                        // Another dispatcher got here first; the publish was
                        // still ours.
                        debug!(message_id = %message.message_id, "Row no longer pending");
                    }
                    Err(e) => {
                        warn!(
                            message_id = %message.message_id,
                            error = %e,
                            "Published but mark_sent failed; message may be republished"
                        );
                    }
                }
                true
            }
            Ok(false) => {
                debug!(
                    message_id = %message.message_id,
                    retry_count = message.retry_count,
                    "Broker refused message"
                );
                self.record_failure(message);
                false
            }
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Publish error"
                );
                self.record_failure(message);
                false
            }
        }
    }

    /// Count one failed attempt: increment the retry counter, or mark the
    /// row failed once this attempt reaches `max_retry`.
    fn record_failure(&self, message: &OutboxMessage) {
        let exhausted = message.retry_count + 1 >= i64::from(self.config.max_retry);
        let result = if exhausted {
            warn!(
                message_id = %message.message_id,
                retry_count = message.retry_count + 1,
                "Max retry exceeded, message failed"
            );
            self.outbox.mark_failed(&message.message_id, MAX_RETRY_ERROR)
        } else {
            self.outbox.increment_retry(&message.message_id)
        };
        if let Err(e) = result {
            warn!(message_id = %message.message_id, error = %e, "Retry bookkeeping failed");
        }
    }

    /// Polling loop: dispatch, then sleep `poll_interval`.
    ///
    /// Cancellable at the sleep boundary: the loop exits when `shutdown`
    /// yields or closes. `max_iterations` bounds the loop for tests.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>, max_iterations: Option<u64>) {
        info!(
            batch_size = self.config.batch_size,
            max_retry = self.config.max_retry,
            poll_interval_seconds = self.config.poll_interval_seconds,
            "Dispatcher started"
        );

        let mut iterations = 0u64;
        loop {
            match self.dispatch_once().await {
                Ok(sent) if sent > 0 => debug!(sent, "Dispatched messages"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Dispatch cycle failed"),
            }

            iterations += 1;
            if max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!(iterations, "Dispatcher stopped");
    }
}

fn decode_options(options: Option<&str>) -> serde_json::Result<PublishOptions> {
    match options {
        Some(text) => serde_json::from_str(text),
        None => Ok(PublishOptions::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaybox_broker::{BrokerError, BrokerResult, ConsumeCallback, DeliveryHandle};
    use relaybox_store::{NewOutboxMessage, OutboxStatus};
    use std::sync::Mutex;

    /// Scripted broker: records publishes and answers from a fixed script.
    struct ScriptedBroker {
        sends: Mutex<Vec<(String, String)>>,
        outcome: SendOutcome,
    }

    enum SendOutcome {
        Accept,
        Refuse,
        Error,
    }

    impl ScriptedBroker {
        fn new(outcome: SendOutcome) -> Arc<Self> {
            Arc::new(Self {
                sends: Mutex::new(Vec::new()),
                outcome,
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerAdapter for ScriptedBroker {
        async fn send(
            &self,
            topic: &str,
            _payload: &[u8],
            message_id: &str,
            _options: &PublishOptions,
        ) -> BrokerResult<bool> {
            self.sends
                .lock()
                .unwrap()
                .push((topic.to_string(), message_id.to_string()));
            match self.outcome {
                SendOutcome::Accept => Ok(true),
                SendOutcome::Refuse => Ok(false),
                SendOutcome::Error => Err(BrokerError::Publish("connection reset".to_string())),
            }
        }

        async fn consume(&self, _topics: &[String], _callback: ConsumeCallback) -> BrokerResult<()> {
            Ok(())
        }

        async fn ack(&self, _handle: DeliveryHandle) -> BrokerResult<()> {
            Ok(())
        }

        async fn nack(&self, _handle: DeliveryHandle, _requeue: bool) -> BrokerResult<()> {
            Ok(())
        }

        async fn close(&self) -> BrokerResult<()> {
            Ok(())
        }
    }

    fn seeded_store(ids: &[&str]) -> OutboxStore {
        let store = OutboxStore::open_in_memory().unwrap();
        store.begin().unwrap();
        let base = chrono::Utc::now();
        for (i, id) in ids.iter().enumerate() {
            store
                .save(&NewOutboxMessage {
                    message_id: id.to_string(),
                    topic: "t".to_string(),
                    payload: "{}".to_string(),
                    options: None,
                    created_at: base + chrono::Duration::milliseconds(i as i64),
                })
                .unwrap();
        }
        store.commit().unwrap();
        store
    }

    fn config(batch_size: usize, max_retry: u32) -> DispatcherConfig {
        DispatcherConfig {
            batch_size,
            max_retry,
            poll_interval_seconds: 0,
        }
    }

    #[tokio::test]
    async fn empty_outbox_never_touches_the_broker() {
        let broker = ScriptedBroker::new(SendOutcome::Accept);
        let dispatcher = Dispatcher::new(
            OutboxStore::open_in_memory().unwrap(),
            broker.clone(),
            config(10, 3),
        );

        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
        assert!(broker.sent().is_empty());
    }

    #[tokio::test]
    async fn successful_dispatch_marks_sent_in_order() {
        let broker = ScriptedBroker::new(SendOutcome::Accept);
        let store = seeded_store(&["m1", "m2", "m3"]);
        let dispatcher = Dispatcher::new(store, broker.clone(), config(10, 3));

        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 3);

        let ids: Vec<_> = broker.sent().into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
        assert_eq!(
            dispatcher.outbox.count_by_status(OutboxStatus::Sent).unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn dispatch_respects_batch_size() {
        let broker = ScriptedBroker::new(SendOutcome::Accept);
        let store = seeded_store(&["m1", "m2", "m3", "m4", "m5"]);
        let dispatcher = Dispatcher::new(store, broker.clone(), config(2, 3));

        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 2);
        assert_eq!(broker.sent().len(), 2);

        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 2);
        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 1);
        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refused_sends_exhaust_into_failed() {
        let broker = ScriptedBroker::new(SendOutcome::Refuse);
        let store = seeded_store(&["m1"]);
        let dispatcher = Dispatcher::new(store, broker.clone(), config(10, 3));

        // Attempts 1 and 2 increment the counter
        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);

        // Attempt 3 reaches max_retry and fails the row
        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
        let row = dispatcher.outbox.get("m1").unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.error.as_deref(), Some("max retry exceeded"));

        // A fourth cycle no longer sees the row
        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
        assert_eq!(broker.sent().len(), 3);
    }

    #[tokio::test]
    async fn broker_errors_feed_the_retry_counter() {
        let broker = ScriptedBroker::new(SendOutcome::Error);
        let store = seeded_store(&["m1", "m2"]);
        let dispatcher = Dispatcher::new(store, broker.clone(), config(10, 5));

        // One record's error never aborts the batch
        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
        assert_eq!(broker.sent().len(), 2);

        let row = dispatcher.outbox.get("m1").unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.retry_count, 1);
    }

    #[tokio::test]
    async fn undecodable_options_count_as_failed_attempt() {
        let store = OutboxStore::open_in_memory().unwrap();
        store.begin().unwrap();
        store
            .save(&NewOutboxMessage {
                message_id: "m1".to_string(),
                topic: "t".to_string(),
                payload: "{}".to_string(),
                options: Some("not json".to_string()),
                created_at: chrono::Utc::now(),
            })
            .unwrap();
        store.commit().unwrap();

        let broker = ScriptedBroker::new(SendOutcome::Accept);
        let dispatcher = Dispatcher::new(store, broker.clone(), config(10, 3));

        assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
        // The broker was never called for the bad record
        assert!(broker.sent().is_empty());
        assert_eq!(
            dispatcher.outbox.get("m1").unwrap().unwrap().retry_count,
            1
        );
    }

    #[tokio::test]
    async fn run_stops_after_max_iterations() {
        let broker = ScriptedBroker::new(SendOutcome::Accept);
        let store = seeded_store(&["m1"]);
        let dispatcher = Dispatcher::new(store, broker.clone(), config(10, 3));

        let (_tx, rx) = mpsc::channel(1);
        dispatcher.run(rx, Some(3)).await;

        assert_eq!(broker.sent().len(), 1);
        assert_eq!(
            dispatcher.outbox.count_by_status(OutboxStatus::Sent).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let broker = ScriptedBroker::new(SendOutcome::Accept);
        let store = seeded_store(&[]);
        let dispatcher = Dispatcher::new(
            store,
            broker,
            DispatcherConfig {
                batch_size: 10,
                max_retry: 3,
                poll_interval_seconds: 30,
            },
        );

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tx.send(()).await.unwrap();
        });

        // Without the signal this would sleep 30 seconds between cycles
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            dispatcher.run(rx, None),
        )
        .await
        .unwrap();
        handle.await.unwrap();
    }
}
