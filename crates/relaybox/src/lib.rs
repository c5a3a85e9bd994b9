//! # relaybox: Transactional Outbox Coordinator
//!
//! relaybox makes local database writes and downstream message publication a
//! single, atomic, eventually-consistent operation. Producers enlist
//! messages in the same SQLite transaction as their business writes; a
//! background dispatcher reliably delivers them to a broker; consumers apply
//! handlers exactly once through a durable idempotency ledger; a
//! compensation scanner rescues permanently failed records on both sides.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   commit   ┌─────────────┐   publish   ┌──────────┐
//! │   Producer   │───────────▶│   Outbox    │────────────▶│  Broker  │
//! │ (+ business  │            │  (SQLite)   │ Dispatcher  │ Adapter  │
//! │   writes)    │            └─────────────┘             └────┬─────┘
//! └──────────────┘                                             │ deliver
//!                             ┌─────────────┐             ┌────▼─────┐
//!                             │ Idempotency │◀────────────│ Consumer │
//!                             │   Ledger    │   record    │ (handler)│
//!                             └─────────────┘             └──────────┘
//!                 failed rows on either side ──▶ Compensation Scanner
//! ```
//!
//! ## Key Guarantees
//!
//! - **Atomic enqueue**: after a successful `commit()`, every staged message
//!   is durably pending in the outbox and all business writes made under the
//!   same transaction are durable; on any failure, neither is.
//!
//! - **At-least-once delivery**: the same message may be published more than
//!   once. The idempotency ledger is the explicit deduplication mechanism;
//!   handlers run at most once per message once `processed` is recorded.
//!
//! - **Bounded retry**: a message refused `max_retry` times transitions to
//!   `failed` and waits for topic-specific compensation, never for another
//!   mechanical retry.
//!
//! ## Example
//!
//! ```ignore
//! use relaybox::{Dispatcher, DispatcherConfig, TransactionalProducer};
//! use relaybox::{ChannelBroker, StorePool, PoolConfig};
//! use std::sync::Arc;
//!
//! let pool = StorePool::open(path, PoolConfig::default())?;
//! let broker = Arc::new(ChannelBroker::new());
//!
//! // Produce atomically with business writes
//! let mut producer = TransactionalProducer::new(pool.outbox()?);
//! producer.begin()?;
//! let id = producer.prepare("order.created", &payload, None)?;
//! producer.commit()?;
//!
//! // Drain the outbox in the background
//! let dispatcher = Dispatcher::new(pool.outbox()?, broker, DispatcherConfig::default());
//! let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
//! tokio::spawn(async move { dispatcher.run(shutdown_rx, None).await });
//! ```

mod compensation;
mod config;
mod consumer;
mod dispatcher;
mod error;
mod producer;

pub use compensation::{CompensationScanner, Compensator};
pub use config::{
    DispatcherConfig, RelayboxConfig, ScannerConfig, DEFAULT_DISPATCH_BATCH_SIZE,
    DEFAULT_DISPATCH_POLL_SECONDS, DEFAULT_MAX_RETRY, DEFAULT_SCAN_BATCH_SIZE,
    DEFAULT_SCAN_POLL_SECONDS,
};
pub use consumer::{EventConsumer, EventHandler, HandlerError, ServiceRegistry};
pub use dispatcher::Dispatcher;
pub use error::{RelayError, RelayResult};
pub use producer::TransactionalProducer;

pub use relaybox_broker::{
    BrokerAdapter, BrokerError, BrokerResult, ChannelBroker, ConsumeCallback, DeliveryHandle,
    Envelope, PublishOptions,
};
pub use relaybox_store::{
    ConsumptionRecord, ConsumptionStatus, ConsumptionStore, NewOutboxMessage, OutboxMessage,
    OutboxStatus, OutboxStore, PoolConfig, PoolState, StoreError, StorePool, StoreResult,
};
