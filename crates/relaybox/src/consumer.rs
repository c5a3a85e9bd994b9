//! Event consumer: route incoming deliveries to handlers under the
//! idempotency ledger.

use crate::compensation::Compensator;
use crate::{RelayError, RelayResult};
use relaybox_broker::{BrokerAdapter, ConsumeCallback, Envelope};
use relaybox_store::{ConsumptionRecord, ConsumptionStore, OutboxMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Error type handlers and compensators may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A topic handler. Returning `Ok(true)` acknowledges the message,
/// `Ok(false)` or `Err` records a failed consumption.
pub trait EventHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> Result<bool, HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&Envelope) -> Result<bool, HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> Result<bool, HandlerError> {
        self(envelope)
    }
}

/// Resolves opaque service names to callables.
///
/// Injected by hosts whose handlers and compensators live in a service
/// container rather than being registered as closures. Every method
/// defaults to "unknown name".
pub trait ServiceRegistry: Send + Sync {
    fn handler(&self, name: &str) -> Option<Arc<dyn EventHandler>> {
        let _ = name;
        None
    }

    fn producer_compensator(&self, name: &str) -> Option<Arc<dyn Compensator<OutboxMessage>>> {
        let _ = name;
        None
    }

    fn consumer_compensator(&self, name: &str) -> Option<Arc<dyn Compensator<ConsumptionRecord>>> {
        let _ = name;
        None
    }
}

/// A registered handler: a direct callable, or a service name resolved
/// lazily through the registry at dispatch time.
enum HandlerRef {
    Callback(Arc<dyn EventHandler>),
    Service(String),
}

/// Idempotent event consumer.
///
/// Registration is additive and happens before `start`; the handler map is
/// not synchronized afterwards.
pub struct EventConsumer {
    broker: Arc<dyn BrokerAdapter>,
    ledger: ConsumptionStore,
    handlers: HashMap<String, HandlerRef>,
    registry: Option<Arc<dyn ServiceRegistry>>,
}

impl EventConsumer {
    pub fn new(broker: Arc<dyn BrokerAdapter>, ledger: ConsumptionStore) -> Self {
        Self {
            broker,
            ledger,
            handlers: HashMap::new(),
            registry: None,
        }
    }

    /// Attach a service registry for name-based handler resolution.
    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a handler for a topic.
    pub fn register<H: EventHandler + 'static>(&mut self, topic: &str, handler: H) {
        self.handlers
            .insert(topic.to_string(), HandlerRef::Callback(Arc::new(handler)));
    }

    /// Register a service name for a topic, resolved through the registry
    /// at first dispatch.
    pub fn register_service(&mut self, topic: &str, service_name: &str) {
        self.handlers.insert(
            topic.to_string(),
            HandlerRef::Service(service_name.to_string()),
        );
    }

    /// Topics with registered handlers.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// The consumption ledger.
    pub fn ledger(&self) -> &ConsumptionStore {
        &self.ledger
    }

    fn resolve_handler(&self, topic: &str) -> Option<Arc<dyn EventHandler>> {
        match self.handlers.get(topic)? {
            HandlerRef::Callback(handler) => Some(Arc::clone(handler)),
            HandlerRef::Service(name) => {
                let resolved = self
                    .registry
                    .as_ref()
                    .and_then(|registry| registry.handler(name));
                if resolved.is_none() {
                    warn!(topic = %topic, service = %name, "Handler service not resolvable");
                }
                resolved
            }
        }
    }

    /// Process one delivery. The returned bool is the ack decision.
    ///
    /// An already-processed message acks without invoking the handler; a
    /// malformed envelope, a missing handler, or a handler failure nacks.
    pub fn process(&self, envelope: &Envelope) -> bool {
        if envelope.message_id.is_empty() || envelope.topic.is_empty() {
            warn!("Invalid message format: missing message_id or topic");
            return false;
        }

        match self.ledger.is_processed(&envelope.message_id) {
            Ok(true) => {
                debug!(message_id = %envelope.message_id, "Already processed, acking");
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(message_id = %envelope.message_id, error = %e, "Ledger lookup failed");
                return false;
            }
        }

        let handler = match self.resolve_handler(&envelope.topic) {
            Some(handler) => handler,
            None => {
                warn!(topic = %envelope.topic, "No handler registered");
                return false;
            }
        };

        let payload_text = if envelope.payload.is_null() {
            None
        } else {
            Some(envelope.payload.to_string())
        };
        if let Err(e) = self.ledger.mark_processing(
            &envelope.message_id,
            Some(&envelope.topic),
            payload_text.as_deref(),
        ) {
            warn!(message_id = %envelope.message_id, error = %e, "mark_processing failed");
            return false;
        }

        match handler.handle(envelope) {
            Ok(true) => match self.ledger.mark_processed(&envelope.message_id) {
                Ok(_) => {
                    debug!(message_id = %envelope.message_id, "Message processed");
                    true
                }
                Err(e) => {
                    warn!(
                        message_id = %envelope.message_id,
                        error = %e,
                        "mark_processed failed, nacking for redelivery"
                    );
                    false
                }
            },
            Ok(false) => {
                self.record_failure(&envelope.message_id, "handler returned false");
                false
            }
            Err(e) => {
                self.record_failure(&envelope.message_id, &e.to_string());
                false
            }
        }
    }

    fn record_failure(&self, message_id: &str, error: &str) {
        warn!(message_id = %message_id, error = %error, "Handler failed");
        if let Err(e) = self.ledger.mark_failed(message_id, error) {
            warn!(message_id = %message_id, error = %e, "mark_failed failed");
        }
    }

    /// Subscribe and process until the broker adapter is closed.
    ///
    /// `topics` defaults to every registered handler's topic.
    pub async fn start(self: &Arc<Self>, topics: Option<Vec<String>>) -> RelayResult<()> {
        let topics = topics.unwrap_or_else(|| self.topics());
        debug!(topics = ?topics, "Consumer starting");

        let consumer = Arc::clone(self);
        let callback: ConsumeCallback = Arc::new(move |envelope| consumer.process(&envelope));
        self.broker
            .consume(&topics, callback)
            .await
            .map_err(RelayError::from)
    }
}
