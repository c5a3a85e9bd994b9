//! Outbox store: persistent messages-to-be-published plus the nested
//! logical transaction counter.
//!
//! One store instance owns one connection and one depth counter. A producer
//! holds its own instance for the duration of a transaction; dispatchers and
//! scanners check their own instances out of the pool.

use crate::pool::StoreConn;
use crate::{schema, NewOutboxMessage, OutboxMessage, OutboxStatus, StoreError, StoreResult};
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

struct TxConn {
    conn: StoreConn,
    /// Logical nesting depth over the single physical transaction.
    depth: u32,
}

/// SQLite-backed outbox store.
pub struct OutboxStore {
    inner: Mutex<TxConn>,
}

impl OutboxStore {
    /// Open a store at the given path, creating the schema if missing.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::apply_pragmas(&conn)?;
        schema::create_outbox_table(&conn)?;
        Ok(Self::from_conn(StoreConn::Direct(conn)))
    }

    /// Open an in-memory store for testing.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create_outbox_table(&conn)?;
        Ok(Self::from_conn(StoreConn::Direct(conn)))
    }

    pub(crate) fn from_conn(conn: StoreConn) -> Self {
        Self {
            inner: Mutex::new(TxConn { conn, depth: 0 }),
        }
    }

    /// Create the outbox table if missing.
    pub fn create_schema(&self) -> StoreResult<()> {
        let inner = self.lock();
        schema::create_outbox_table(inner.conn.as_ref())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TxConn> {
        self.inner.lock().expect("lock poisoned")
    }

    // ==========================================
    // Nested logical transactions
    // ==========================================

    /// Begin a logical transaction.
    ///
    /// Opens the physical transaction only on the 0 -> 1 depth transition;
    /// deeper calls just increment the counter. The transaction is deferred:
    /// the write lock is taken at the first write, not here.
    pub fn begin(&self) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.depth == 0 {
            inner.conn.as_ref().execute_batch("BEGIN")?;
        }
        inner.depth += 1;
        debug!(depth = inner.depth, "Outbox transaction begin");
        Ok(())
    }

    /// Commit a logical transaction.
    ///
    /// Physically commits only on the 1 -> 0 transition. Committing with no
    /// open transaction is a soft failure: it returns `Ok(false)` and logs.
    pub fn commit(&self) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner.depth == 0 {
            warn!("Outbox commit with no open transaction");
            return Ok(false);
        }
        inner.depth -= 1;
        if inner.depth == 0 {
            if let Err(e) = inner.conn.as_ref().execute_batch("COMMIT") {
                let _ = inner.conn.as_ref().execute_batch("ROLLBACK");
                return Err(e.into());
            }
        }
        debug!(depth = inner.depth, "Outbox transaction commit");
        Ok(true)
    }

    /// Roll back the whole transaction stack.
    ///
    /// Destructive at any depth: aborts the physical transaction and resets
    /// the counter to 0. With no open transaction this is a soft failure
    /// returning `Ok(false)`.
    pub fn rollback(&self) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner.depth == 0 {
            warn!("Outbox rollback with no open transaction");
            return Ok(false);
        }
        inner.depth = 0;
        inner.conn.as_ref().execute_batch("ROLLBACK")?;
        debug!("Outbox transaction rolled back");
        Ok(true)
    }

    /// Run a closure against the store's connection, inside whatever
    /// transaction is currently open.
    ///
    /// This is how a host application's business writes join a producer's
    /// transaction and commit (or roll back) atomically with the staged
    /// messages.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let inner = self.lock();
        Ok(f(inner.conn.as_ref())?)
    }

    /// Whether a logical transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.lock().depth > 0
    }

    /// Current logical nesting depth.
    pub fn transaction_depth(&self) -> u32 {
        self.lock().depth
    }

    // ==========================================
    // Writes
    // ==========================================

    /// Persist a staged message with `status = pending`.
    ///
    /// Must run inside an open transaction. A duplicate `message_id` or any
    /// backend failure surfaces as an error.
    pub fn save(&self, message: &NewOutboxMessage) -> StoreResult<()> {
        let inner = self.lock();
        if inner.depth == 0 {
            return Err(StoreError::NotInTransaction);
        }
        let created_at = message.created_at.to_rfc3339();
        inner.conn.as_ref().execute(
            "INSERT INTO mq_messages (message_id, topic, data, options, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
            params![
                message.message_id,
                message.topic,
                message.payload,
                message.options,
                created_at,
            ],
        )?;
        Ok(())
    }

    /// Transition a pending row to `sent`. Returns false if no row matched.
    pub fn mark_sent(&self, message_id: &str) -> StoreResult<bool> {
        let inner = self.lock();
        let now = Utc::now().to_rfc3339();
        let count = inner.conn.as_ref().execute(
            "UPDATE mq_messages SET status = 'sent', updated_at = ?2
             WHERE message_id = ?1 AND status = 'pending'",
            params![message_id, now],
        )?;
        Ok(count > 0)
    }

    /// Transition a pending row to `failed`, recording the final failed
    /// attempt: the error text is stored and `retry_count` incremented.
    pub fn mark_failed(&self, message_id: &str, error: &str) -> StoreResult<bool> {
        let inner = self.lock();
        let now = Utc::now().to_rfc3339();
        let count = inner.conn.as_ref().execute(
            "UPDATE mq_messages
             SET status = 'failed', error = ?2, retry_count = retry_count + 1, updated_at = ?3
             WHERE message_id = ?1 AND status = 'pending'",
            params![message_id, error, now],
        )?;
        Ok(count > 0)
    }

    /// Transition a failed row to `compensated`. Returns false if no row
    /// matched (absent, or not in `failed`).
    pub fn mark_compensated(&self, message_id: &str) -> StoreResult<bool> {
        let inner = self.lock();
        let now = Utc::now().to_rfc3339();
        let count = inner.conn.as_ref().execute(
            "UPDATE mq_messages SET status = 'compensated', updated_at = ?2
             WHERE message_id = ?1 AND status = 'failed'",
            params![message_id, now],
        )?;
        Ok(count > 0)
    }

    /// Increment the retry counter of a pending row.
    pub fn increment_retry(&self, message_id: &str) -> StoreResult<bool> {
        let inner = self.lock();
        let now = Utc::now().to_rfc3339();
        let count = inner.conn.as_ref().execute(
            "UPDATE mq_messages SET retry_count = retry_count + 1, updated_at = ?2
             WHERE message_id = ?1 AND status = 'pending'",
            params![message_id, now],
        )?;
        Ok(count > 0)
    }

    // ==========================================
    // Reads
    // ==========================================

    /// Fetch up to `limit` pending rows, oldest first.
    pub fn fetch_pending(&self, limit: usize) -> StoreResult<Vec<OutboxMessage>> {
        self.fetch_by_status(OutboxStatus::Pending, "created_at", limit)
    }

    /// Fetch up to `limit` failed rows, oldest failure first.
    pub fn fetch_failed(&self, limit: usize) -> StoreResult<Vec<OutboxMessage>> {
        self.fetch_by_status(OutboxStatus::Failed, "updated_at", limit)
    }

    fn fetch_by_status(
        &self,
        status: OutboxStatus,
        order_column: &str,
        limit: usize,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let inner = self.lock();
        let sql = format!(
            "SELECT id, message_id, topic, data, options, status, error, retry_count,
                    created_at, updated_at
             FROM mq_messages
             WHERE status = ?1
             ORDER BY {order_column} ASC, id ASC
             LIMIT ?2",
        );
        let mut stmt = inner.conn.as_ref().prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![status.as_str(), limit as i64], map_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Look up a single row by message id.
    pub fn get(&self, message_id: &str) -> StoreResult<Option<OutboxMessage>> {
        let inner = self.lock();
        let mut stmt = inner.conn.as_ref().prepare_cached(
            "SELECT id, message_id, topic, data, options, status, error, retry_count,
                    created_at, updated_at
             FROM mq_messages WHERE message_id = ?1",
        )?;
        let result = stmt.query_row(params![message_id], map_message);
        match result {
            Ok(message) => Ok(Some(message)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Count rows in a given status.
    pub fn count_by_status(&self, status: OutboxStatus) -> StoreResult<i64> {
        let inner = self.lock();
        let count = inner.conn.as_ref().query_row(
            "SELECT COUNT(*) FROM mq_messages WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<OutboxMessage> {
    let status_text: String = row.get(5)?;
    let status = OutboxStatus::parse(&status_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(OutboxMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        topic: row.get(2)?,
        payload: row.get(3)?,
        options: row.get(4)?,
        status,
        error: row.get(6)?,
        retry_count: row.get(7)?,
        created_at: crate::parse_datetime(row.get::<_, String>(8)?),
        updated_at: crate::parse_datetime(row.get::<_, String>(9)?),
    })
}
