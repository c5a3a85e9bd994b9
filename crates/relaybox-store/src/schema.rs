//! Schema creation for the outbox and consumption tables.
//!
//! All DDL is idempotent (`IF NOT EXISTS`) so `create_schema` can run on
//! every startup.

use crate::StoreResult;
use rusqlite::Connection;
use tracing::debug;

/// Outbox table name.
pub const OUTBOX_TABLE: &str = "mq_messages";

/// Consumption ledger table name.
pub const CONSUMPTION_TABLE: &str = "mq_consumption_records";

/// Create the outbox table and its indexes if missing.
pub fn create_outbox_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS mq_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            topic TEXT NOT NULL,
            data TEXT NOT NULL,
            options TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_mq_messages_status_created_at
            ON mq_messages(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_mq_messages_status_updated_at
            ON mq_messages(status, updated_at);
        ",
    )?;
    debug!(table = OUTBOX_TABLE, "Outbox schema ready");
    Ok(())
}

/// Create the consumption ledger table and its indexes if missing.
pub fn create_consumption_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS mq_consumption_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL UNIQUE,
            topic TEXT,
            data TEXT,
            status TEXT NOT NULL DEFAULT 'processing',
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mq_consumption_status_updated_at
            ON mq_consumption_records(status, updated_at);
        ",
    )?;
    debug!(table = CONSUMPTION_TABLE, "Consumption schema ready");
    Ok(())
}

/// Pragmas applied to every store connection.
pub(crate) fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
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
}
