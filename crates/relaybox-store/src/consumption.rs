//! Consumption store: the durable idempotency ledger for consumers.

use crate::pool::StoreConn;
use crate::{schema, ConsumptionRecord, ConsumptionStatus, StoreResult};
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed idempotency ledger.
pub struct ConsumptionStore {
    conn: Mutex<StoreConn>,
}

impl ConsumptionStore {
    /// Open a store at the given path, creating the schema if missing.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::apply_pragmas(&conn)?;
        schema::create_consumption_table(&conn)?;
        Ok(Self::from_conn(StoreConn::Direct(conn)))
    }

    /// Open an in-memory store for testing.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create_consumption_table(&conn)?;
        Ok(Self::from_conn(StoreConn::Direct(conn)))
    }

    pub(crate) fn from_conn(conn: StoreConn) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Create the ledger table if missing.
    pub fn create_schema(&self) -> StoreResult<()> {
        let conn = self.lock();
        schema::create_consumption_table(conn.as_ref())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreConn> {
        self.conn.lock().expect("lock poisoned")
    }

    /// Whether a message has already been fully processed.
    ///
    /// Only `status = processed` counts; a row stuck in `processing` or
    /// `failed` is not a completed delivery.
    pub fn is_processed(&self, message_id: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let processed: bool = conn.as_ref().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM mq_consumption_records
                WHERE message_id = ?1 AND status = 'processed'
             )",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(processed)
    }

    /// Record that a consumer has started processing a message.
    ///
    /// The only write that may create rows. On an existing row it re-enters
    /// `processing` from `processing` or `failed` (redelivery); `processed`
    /// and `compensated` rows are left untouched.
    pub fn mark_processing(
        &self,
        message_id: &str,
        topic: Option<&str>,
        payload: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        conn.as_ref().execute(
            "INSERT INTO mq_consumption_records (message_id, topic, data, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'processing', ?4, ?4)
             ON CONFLICT(message_id) DO UPDATE SET
                 status = 'processing',
                 topic = COALESCE(excluded.topic, topic),
                 data = COALESCE(excluded.data, data),
                 error = NULL,
                 updated_at = excluded.updated_at
             WHERE status IN ('processing', 'failed')",
            params![message_id, topic, payload, now],
        )?;
        Ok(())
    }

    /// Transition a row to `processed`. Idempotent: repeating the call on a
    /// processed row keeps it processed and still returns true.
    pub fn mark_processed(&self, message_id: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let count = conn.as_ref().execute(
            "UPDATE mq_consumption_records SET status = 'processed', error = NULL, updated_at = ?2
             WHERE message_id = ?1 AND status IN ('processing', 'processed')",
            params![message_id, now],
        )?;
        Ok(count > 0)
    }

    /// Transition a processing row to `failed` with the handler's error.
    pub fn mark_failed(&self, message_id: &str, error: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let count = conn.as_ref().execute(
            "UPDATE mq_consumption_records SET status = 'failed', error = ?2, updated_at = ?3
             WHERE message_id = ?1 AND status = 'processing'",
            params![message_id, error, now],
        )?;
        Ok(count > 0)
    }

    /// Transition a failed row to `compensated`.
    pub fn mark_compensated(&self, message_id: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let count = conn.as_ref().execute(
            "UPDATE mq_consumption_records SET status = 'compensated', updated_at = ?2
             WHERE message_id = ?1 AND status = 'failed'",
            params![message_id, now],
        )?;
        Ok(count > 0)
    }

    /// Fetch up to `limit` failed rows, oldest failure first.
    pub fn fetch_failed(&self, limit: usize) -> StoreResult<Vec<ConsumptionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.as_ref().prepare_cached(
            "SELECT id, message_id, topic, data, status, error, created_at, updated_at
             FROM mq_consumption_records
             WHERE status = 'failed'
             ORDER BY updated_at ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], map_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Look up a single ledger row by message id.
    pub fn get(&self, message_id: &str) -> StoreResult<Option<ConsumptionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.as_ref().prepare_cached(
            "SELECT id, message_id, topic, data, status, error, created_at, updated_at
             FROM mq_consumption_records WHERE message_id = ?1",
        )?;
        let result = stmt.query_row(params![message_id], map_record);
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Count rows in a given status.
    pub fn count_by_status(&self, status: ConsumptionStatus) -> StoreResult<i64> {
        let conn = self.lock();
        let count = conn.as_ref().query_row(
            "SELECT COUNT(*) FROM mq_consumption_records WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<ConsumptionRecord> {
    let status_text: String = row.get(4)?;
    let status = ConsumptionStatus::parse(&status_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ConsumptionRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        topic: row.get(2)?,
        payload: row.get(3)?,
        status,
        error: row.get(5)?,
        created_at: crate::parse_datetime(row.get::<_, String>(6)?),
        updated_at: crate::parse_datetime(row.get::<_, String>(7)?),
    })
}
