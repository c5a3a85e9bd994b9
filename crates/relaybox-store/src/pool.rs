//! Connection pool handing dedicated connections to concurrent workers.
//!
//! Store instances are single-connection by design: a producer's transaction
//! counter only makes sense over one connection it exclusively owns. The
//! pool exists so that dispatchers, consumers, and scanners running in the
//! same process can each check out their own store without reopening the
//! database. WAL mode keeps readers unblocked while one writer commits.

use crate::{schema, ConsumptionStore, OutboxStore, StoreError, StoreResult};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// A store's underlying connection: directly opened, or checked out of a
/// pool for the lifetime of the store instance.
pub(crate) enum StoreConn {
    Direct(Connection),
    Pooled(PooledConnection<SqliteConnectionManager>),
}

impl AsRef<Connection> for StoreConn {
    fn as_ref(&self) -> &Connection {
        match self {
            Self::Direct(conn) => conn,
            Self::Pooled(conn) => conn,
        }
    }
}

/// Configuration for the store pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections in the pool. Bounds the number of concurrently
    /// checked-out store instances.
    pub max_size: u32,
    /// Minimum idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Connection acquisition timeout.
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: Some(2),
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone)]
pub struct PoolState {
    /// Total connections (active + idle).
    pub connections: u32,
    /// Currently idle connections.
    pub idle_connections: u32,
}

/// Thread-safe connection pool over one SQLite database file.
pub struct StorePool {
    pool: Pool<SqliteConnectionManager>,
    path: String,
}

impl StorePool {
    /// Create a pool at the given path.
    ///
    /// Creates the database file if needed, applies the WAL pragma set to
    /// every connection, and creates both schemas once up front.
    pub fn open(path: &Path, config: PoolConfig) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
            ",
            )?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(config.min_idle)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        {
            let conn = pool
                .get()
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            schema::create_outbox_table(&conn)?;
            schema::create_consumption_table(&conn)?;
        }

        info!(path = %path_str, max_size = config.max_size, "Store pool created");

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    fn checkout(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// Check out an outbox store over a dedicated connection.
    pub fn outbox(&self) -> StoreResult<OutboxStore> {
        Ok(OutboxStore::from_conn(StoreConn::Pooled(self.checkout()?)))
    }

    /// Check out a consumption store over a dedicated connection.
    pub fn consumption(&self) -> StoreResult<ConsumptionStore> {
        Ok(ConsumptionStore::from_conn(StoreConn::Pooled(
            self.checkout()?,
        )))
    }

    /// Get pool statistics for monitoring.
    pub fn state(&self) -> PoolState {
        let state = self.pool.state();
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check pool health by acquiring a connection and running a query.
    pub fn health_check(&self) -> StoreResult<()> {
        let conn = self.checkout()?;
        conn.execute_batch("SELECT 1")?;
        debug!("Store pool health check passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewOutboxMessage;
    use chrono::Utc;

    fn temp_pool() -> (tempfile::TempDir, StorePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = StorePool::open(&dir.path().join("relay.db"), PoolConfig::default()).unwrap();
        (dir, pool)
    }

    #[test]
    fn pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 10);
        assert_eq!(config.min_idle, Some(2));
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn pool_open_and_health_check() {
        let (_dir, pool) = temp_pool();
        assert!(pool.health_check().is_ok());
        assert!(pool.state().connections >= 1);
    }

    #[test]
    fn stores_share_one_database() {
        let (_dir, pool) = temp_pool();
        let writer = pool.outbox().unwrap();
        let reader = pool.outbox().unwrap();

        writer.begin().unwrap();
        writer
            .save(&NewOutboxMessage {
                message_id: "m1".to_string(),
                topic: "t".to_string(),
                payload: "{}".to_string(),
                options: None,
                created_at: Utc::now(),
            })
            .unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.fetch_pending(10).unwrap().len(), 1);
    }

    #[test]
    fn transaction_counters_are_instance_scoped() {
        let (_dir, pool) = temp_pool();
        let a = pool.outbox().unwrap();
        let b = pool.outbox().unwrap();

        a.begin().unwrap();
        assert!(a.in_transaction());
        assert!(!b.in_transaction());
        a.rollback().unwrap();
    }

    #[test]
    fn consumption_store_from_pool() {
        let (_dir, pool) = temp_pool();
        let ledger = pool.consumption().unwrap();
        ledger.mark_processing("m1", Some("t"), None).unwrap();
        ledger.mark_processed("m1").unwrap();

        let other = pool.consumption().unwrap();
        assert!(other.is_processed("m1").unwrap());
    }
}
