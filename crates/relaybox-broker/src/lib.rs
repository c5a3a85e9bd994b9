//! Broker adapter surface for the relaybox coordinator.
//!
//! This crate provides:
//! - `BrokerAdapter`: the uniform async interface the core depends on
//!   (publish, subscribe, ack, nack, close)
//! - `Envelope` / `DeliveryHandle` / `PublishOptions`: the delivery types
//! - `ChannelBroker`: an in-process topic broker over tokio primitives,
//!   used by tests and single-process deployments
//!
//! Concrete AMQP- or log-style adapters implement `BrokerAdapter` in their
//! own crates; nothing broker-specific leaks through this surface.

mod adapter;
mod channel;
mod envelope;
mod error;

pub use adapter::{BrokerAdapter, ConsumeCallback};
pub use channel::ChannelBroker;
pub use envelope::{DeliveryHandle, Envelope, PublishOptions};
pub use error::{BrokerError, BrokerResult};
