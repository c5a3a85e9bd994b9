//! Transactional producer: stage messages in memory, persist and commit
//! atomically with the host's business writes.

use crate::{RelayError, RelayResult};
use chrono::Utc;
use relaybox_broker::PublishOptions;
use relaybox_store::{NewOutboxMessage, OutboxStore};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// Transactional producer over one exclusively owned outbox store.
///
/// One instance per request; never shared across concurrent requests. The
/// state machine is idle -> in_txn -> idle: `commit` returns to idle on
/// success, `rollback` returns to idle always.
pub struct TransactionalProducer {
    outbox: OutboxStore,
    staged: Vec<NewOutboxMessage>,
    in_transaction: bool,
}

impl TransactionalProducer {
    pub fn new(outbox: OutboxStore) -> Self {
        Self {
            outbox,
            staged: Vec::new(),
            in_transaction: false,
        }
    }

    /// The underlying store. Business writes join the open transaction via
    /// `OutboxStore::with_connection`.
    pub fn outbox(&self) -> &OutboxStore {
        &self.outbox
    }

    /// Number of messages staged in the open transaction.
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Open a transaction and clear the staged list.
    pub fn begin(&mut self) -> RelayResult<()> {
        if self.in_transaction {
            return Err(RelayError::AlreadyInTransaction);
        }
        self.outbox.begin()?;
        self.staged.clear();
        self.in_transaction = true;
        Ok(())
    }

    /// Stage a message and return its freshly generated message id.
    ///
    /// The payload and options are serialized to JSON text at staging time;
    /// timestamps and the pending status are fixed here too.
    pub fn prepare<T: Serialize>(
        &mut self,
        topic: &str,
        payload: &T,
        options: Option<&PublishOptions>,
    ) -> RelayResult<String> {
        if !self.in_transaction {
            return Err(RelayError::NotInTransaction);
        }

        let message_id = Uuid::new_v4().to_string();
        let staged = NewOutboxMessage {
            message_id: message_id.clone(),
            topic: topic.to_string(),
            payload: serde_json::to_string(payload)?,
            options: options.map(serde_json::to_string).transpose()?,
            created_at: Utc::now(),
        };
        debug!(message_id = %message_id, topic = %topic, "Message staged");
        self.staged.push(staged);
        Ok(message_id)
    }

    /// Persist every staged message and commit the transaction.
    ///
    /// After a successful return, all staged messages are durably pending in
    /// the outbox and every business write made under the same transaction
    /// is durable. On any save failure the whole transaction is rolled back
    /// and `SaveFailed` surfaces; nothing is durable.
    pub fn commit(&mut self) -> RelayResult<()> {
        if !self.in_transaction {
            return Err(RelayError::NotInTransaction);
        }

        let staged = std::mem::take(&mut self.staged);
        for message in &staged {
            if let Err(source) = self.outbox.save(message) {
                let message_id = message.message_id.clone();
                warn!(message_id = %message_id, error = %source, "Save failed, rolling back");
                self.rollback()?;
                return Err(RelayError::SaveFailed { message_id, source });
            }
        }

        self.in_transaction = false;
        self.outbox.commit()?;
        debug!(messages = staged.len(), "Producer transaction committed");
        Ok(())
    }

    /// Abort the transaction and discard the staged list.
    ///
    /// Unconditional and idempotent: safe to call as cleanup after a failed
    /// `commit`, or with no transaction open at all.
    pub fn rollback(&mut self) -> RelayResult<()> {
        self.staged.clear();
        self.in_transaction = false;
        self.outbox.rollback()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybox_store::OutboxStatus;
    use serde_json::json;

    fn producer() -> TransactionalProducer {
        TransactionalProducer::new(OutboxStore::open_in_memory().unwrap())
    }

    #[test]
    fn begin_twice_is_an_invariant_violation() {
        let mut p = producer();
        p.begin().unwrap();
        assert!(matches!(p.begin(), Err(RelayError::AlreadyInTransaction)));
    }

    #[test]
    fn prepare_outside_transaction_is_an_invariant_violation() {
        let mut p = producer();
        let err = p.prepare("t", &json!({}), None).unwrap_err();
        assert!(matches!(err, RelayError::NotInTransaction));
    }

    #[test]
    fn commit_outside_transaction_is_an_invariant_violation() {
        let mut p = producer();
        assert!(matches!(p.commit(), Err(RelayError::NotInTransaction)));
    }

    #[test]
    fn prepare_returns_unique_ids() {
        let mut p = producer();
        p.begin().unwrap();
        let a = p.prepare("t", &json!({"n": 1}), None).unwrap();
        let b = p.prepare("t", &json!({"n": 2}), None).unwrap();
        assert_ne!(a, b);
        assert_eq!(p.staged_count(), 2);
    }

    #[test]
    fn commit_persists_all_staged_messages_as_pending() {
        let mut p = producer();
        p.begin().unwrap();
        let id = p
            .prepare("order.created", &json!({"order_id": 1001}), None)
            .unwrap();
        p.prepare("order.created", &json!({"order_id": 1002}), None)
            .unwrap();
        p.commit().unwrap();

        let pending = p.outbox().fetch_pending(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].message_id, id);
        assert_eq!(pending[0].status, OutboxStatus::Pending);
        assert_eq!(pending[0].payload, r#"{"order_id":1001}"#);
        assert_eq!(p.staged_count(), 0);

        // Producer is idle again
        p.begin().unwrap();
        p.rollback().unwrap();
    }

    #[test]
    fn rollback_discards_staged_messages() {
        let mut p = producer();
        p.begin().unwrap();
        p.prepare("t", &json!({}), None).unwrap();
        p.rollback().unwrap();

        assert!(p.outbox().fetch_pending(10).unwrap().is_empty());
        assert_eq!(p.staged_count(), 0);
    }

    #[test]
    fn rollback_is_idempotent() {
        let mut p = producer();
        p.rollback().unwrap();
        p.begin().unwrap();
        p.rollback().unwrap();
        p.rollback().unwrap();
    }

    #[test]
    fn options_are_serialized_with_the_message() {
        let mut p = producer();
        p.begin().unwrap();
        let mut options = PublishOptions::new();
        options.insert("delivery_mode".to_string(), json!(2));
        p.prepare("t", &json!({}), Some(&options)).unwrap();
        p.commit().unwrap();

        let pending = p.outbox().fetch_pending(10).unwrap();
        assert_eq!(pending[0].options.as_deref(), Some(r#"{"delivery_mode":2}"#));
    }

    #[test]
    fn failed_save_rolls_back_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let mut p = TransactionalProducer::new(OutboxStore::open(&path).unwrap());
        let other = OutboxStore::open(&path).unwrap();

        p.begin().unwrap();
        p.prepare("t", &json!({"n": 1}), None).unwrap();
        let colliding = p.prepare("t", &json!({"n": 2}), None).unwrap();

        // A rival writer takes the second message id before commit, so the
        // producer's second save hits the UNIQUE constraint.
        other.begin().unwrap();
        other
            .save(&NewOutboxMessage {
                message_id: colliding.clone(),
                topic: "rival".to_string(),
                payload: "{}".to_string(),
                options: None,
                created_at: Utc::now(),
            })
            .unwrap();
        other.commit().unwrap();

        let err = p.commit().unwrap_err();
        match err {
            RelayError::SaveFailed { message_id, .. } => assert_eq!(message_id, colliding),
            other => panic!("unexpected error: {other}"),
        }

        // Nothing from this producer is durable; the rival row is all there is
        let rows = other.fetch_pending(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, "rival");
        assert!(!p.outbox().in_transaction());
    }

    #[test]
    fn business_writes_commit_with_the_messages() {
        let mut p = producer();
        p.outbox()
            .with_connection(|conn| {
                conn.execute("CREATE TABLE orders (id INTEGER PRIMARY KEY, total INTEGER)", [])
            })
            .unwrap();

        p.begin().unwrap();
        p.prepare("order.created", &json!({"order_id": 1}), None)
            .unwrap();
        p.outbox()
            .with_connection(|conn| {
                conn.execute("INSERT INTO orders (id, total) VALUES (1, 250)", [])
            })
            .unwrap();
        p.commit().unwrap();

        let total: i64 = p
            .outbox()
            .with_connection(|conn| {
                conn.query_row("SELECT total FROM orders WHERE id = 1", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(total, 250);
        assert_eq!(p.outbox().fetch_pending(10).unwrap().len(), 1);
    }

    #[test]
    fn business_writes_roll_back_with_the_messages() {
        let mut p = producer();
        p.outbox()
            .with_connection(|conn| {
                conn.execute("CREATE TABLE orders (id INTEGER PRIMARY KEY)", [])
            })
            .unwrap();

        p.begin().unwrap();
        p.prepare("order.created", &json!({}), None).unwrap();
        p.outbox()
            .with_connection(|conn| conn.execute("INSERT INTO orders (id) VALUES (1)", []))
            .unwrap();
        p.rollback().unwrap();

        let count: i64 = p
            .outbox()
            .with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(count, 0);
        assert!(p.outbox().fetch_pending(10).unwrap().is_empty());
    }
}
