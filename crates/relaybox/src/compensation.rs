//! Compensation scanner: rescue terminally failed records on both sides.
//!
//! Compensation is a manual, topic-specific business callback rather than
//! another retry layer: by the time a record is failed, mechanical retry has
//! already been exhausted, and resolution needs business intent (refund,
//! restock, cancel).

use crate::consumer::{HandlerError, ServiceRegistry};
use crate::{RelayResult, ScannerConfig};
use relaybox_store::{ConsumptionRecord, ConsumptionStore, OutboxMessage, OutboxStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A topic-scoped compensator over a failed record.
///
/// Returning `Ok(true)` means the failure is resolved and the record may be
/// marked compensated; `Ok(false)` or `Err` leaves it failed for the next
/// scan.
pub trait Compensator<R>: Send + Sync {
    fn compensate(&self, record: &R) -> Result<bool, HandlerError>;
}

impl<R, F> Compensator<R> for F
where
    F: Fn(&R) -> Result<bool, HandlerError> + Send + Sync,
{
    fn compensate(&self, record: &R) -> Result<bool, HandlerError> {
        self(record)
    }
}

enum CompensatorRef<R> {
    Callback(Arc<dyn Compensator<R>>),
    Service(String),
}

/// Scanner over failed outbox rows and failed consumption records.
pub struct CompensationScanner {
    outbox: OutboxStore,
    ledger: ConsumptionStore,
    producer_compensators: HashMap<String, CompensatorRef<OutboxMessage>>,
    consumer_compensators: HashMap<String, CompensatorRef<ConsumptionRecord>>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    config: ScannerConfig,
}

impl CompensationScanner {
    pub fn new(outbox: OutboxStore, ledger: ConsumptionStore, config: ScannerConfig) -> Self {
        Self {
            outbox,
            ledger,
            producer_compensators: HashMap::new(),
            consumer_compensators: HashMap::new(),
            registry: None,
            config,
        }
    }

    /// Attach a service registry for name-based compensator resolution.
    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a producer-side compensator for a topic.
    pub fn register_producer<C>(&mut self, topic: &str, compensator: C)
    where
        C: Compensator<OutboxMessage> + 'static,
    {
        self.producer_compensators.insert(
            topic.to_string(),
            CompensatorRef::Callback(Arc::new(compensator)),
        );
    }

    /// Register a producer-side compensator by service name.
    pub fn register_producer_service(&mut self, topic: &str, service_name: &str) {
        self.producer_compensators.insert(
            topic.to_string(),
            CompensatorRef::Service(service_name.to_string()),
        );
    }

    /// Register a consumer-side compensator for a topic.
    pub fn register_consumer<C>(&mut self, topic: &str, compensator: C)
    where
        C: Compensator<ConsumptionRecord> + 'static,
    {
        self.consumer_compensators.insert(
            topic.to_string(),
            CompensatorRef::Callback(Arc::new(compensator)),
        );
    }

    /// Register a consumer-side compensator by service name.
    pub fn register_consumer_service(&mut self, topic: &str, service_name: &str) {
        self.consumer_compensators.insert(
            topic.to_string(),
            CompensatorRef::Service(service_name.to_string()),
        );
    }

    fn resolve_producer(&self, topic: &str) -> Option<Arc<dyn Compensator<OutboxMessage>>> {
        match self.producer_compensators.get(topic)? {
            CompensatorRef::Callback(compensator) => Some(Arc::clone(compensator)),
            CompensatorRef::Service(name) => {
                let resolved = self
                    .registry
                    .as_ref()
                    .and_then(|registry| registry.producer_compensator(name));
                if resolved.is_none() {
                    warn!(topic = %topic, service = %name, "Producer compensator not resolvable");
                }
                resolved
            }
        }
    }

    fn resolve_consumer(&self, topic: &str) -> Option<Arc<dyn Compensator<ConsumptionRecord>>> {
        match self.consumer_compensators.get(topic)? {
            CompensatorRef::Callback(compensator) => Some(Arc::clone(compensator)),
            CompensatorRef::Service(name) => {
                let resolved = self
                    .registry
                    .as_ref()
                    .and_then(|registry| registry.consumer_compensator(name));
                if resolved.is_none() {
                    warn!(topic = %topic, service = %name, "Consumer compensator not resolvable");
                }
                resolved
            }
        }
    }

    /// Scan failed outbox rows once; returns how many were compensated.
    ///
    /// A record with no registered compensator is skipped with a warning.
    /// A compensator returning false or erroring leaves the record failed;
    /// nothing is retried within the same scan and no record aborts the
    /// batch.
    pub fn check_producer(&self) -> RelayResult<usize> {
        let failed = self.outbox.fetch_failed(self.config.batch_size)?;
        let mut compensated = 0;

        for record in &failed {
            let compensator = match self.resolve_producer(&record.topic) {
                Some(compensator) => compensator,
                None => {
                    warn!(
                        message_id = %record.message_id,
                        topic = %record.topic,
                        "No producer compensator registered, skipping"
                    );
                    continue;
                }
            };

            match compensator.compensate(record) {
                Ok(true) => match self.outbox.mark_compensated(&record.message_id) {
                    Ok(true) => {
                        debug!(message_id = %record.message_id, "Outbox record compensated");
                        compensated += 1;
                    }
                    Ok(false) => {
                        debug!(message_id = %record.message_id, "Record no longer failed");
                    }
                    Err(e) => {
                        warn!(message_id = %record.message_id, error = %e, "mark_compensated failed");
                    }
                },
                Ok(false) => {
                    error!(
                        message_id = %record.message_id,
                        topic = %record.topic,
                        "Producer compensator declined"
                    );
                }
                Err(e) => {
                    error!(
                        message_id = %record.message_id,
                        topic = %record.topic,
                        error = %e,
                        "Producer compensator failed"
                    );
                }
            }
        }

        Ok(compensated)
    }

    /// Scan failed consumption records once; returns how many were
    /// compensated.
    pub fn check_consumer(&self) -> RelayResult<usize> {
        let failed = self.ledger.fetch_failed(self.config.batch_size)?;
        let mut compensated = 0;

        for record in &failed {
            let topic = record.topic.as_deref().unwrap_or("");
            let compensator = match self.resolve_consumer(topic) {
                Some(compensator) => compensator,
                None => {
                    warn!(
                        message_id = %record.message_id,
                        topic = %topic,
                        "No consumer compensator registered, skipping"
                    );
                    continue;
                }
            };

            match compensator.compensate(record) {
                Ok(true) => match self.ledger.mark_compensated(&record.message_id) {
                    Ok(true) => {
                        debug!(message_id = %record.message_id, "Consumption record compensated");
                        compensated += 1;
                    }
                    Ok(false) => {
                        debug!(message_id = %record.message_id, "Record no longer failed");
                    }
                    Err(e) => {
                        warn!(message_id = %record.message_id, error = %e, "mark_compensated failed");
                    }
                },
                Ok(false) => {
                    error!(
                        message_id = %record.message_id,
                        topic = %topic,
                        "Consumer compensator declined"
                    );
                }
                Err(e) => {
                    error!(
                        message_id = %record.message_id,
                        topic = %topic,
                        error = %e,
                        "Consumer compensator failed"
                    );
                }
            }
        }

        Ok(compensated)
    }

    /// Polling loop: scan both sides, then sleep `poll_interval`.
    ///
    /// Cancellable at the sleep boundary; `max_iterations` bounds the loop
    /// for tests.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>, max_iterations: Option<u64>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_seconds = self.config.poll_interval_seconds,
            "Compensation scanner started"
        );

        let mut iterations = 0u64;
        loop {
            match self.check_producer() {
                Ok(count) if count > 0 => debug!(count, "Compensated outbox records"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Producer scan failed"),
            }
            match self.check_consumer() {
                Ok(count) if count > 0 => debug!(count, "Compensated consumption records"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Consumer scan failed"),
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

        info!(iterations, "Compensation scanner stopped");
    }
}
