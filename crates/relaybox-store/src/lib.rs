//! SQLite persistence layer for the relaybox coordinator.
//!
//! This crate provides:
//! - `OutboxStore`: the outbox table plus nested logical transactions
//! - `ConsumptionStore`: the consumer-side idempotency ledger
//! - `StorePool`: r2d2 connection pool handing dedicated connections to workers
//! - Model types and idempotent schema creation
//!
//! Both stores share one database file; each store instance owns exactly one
//! connection. Producers, dispatchers, and scanners never share a store
//! instance — they check their own out of the pool.

mod consumption;
mod error;
mod models;
mod outbox;
mod pool;
pub mod schema;

pub use consumption::ConsumptionStore;
pub use error::{StoreError, StoreResult};
pub use models::{
    ConsumptionRecord, ConsumptionStatus, NewOutboxMessage, OutboxMessage, OutboxStatus,
};
pub use outbox::OutboxStore;
pub use pool::{PoolConfig, PoolState, StorePool};

pub(crate) use models::parse_datetime;
