//! Store model types.

use crate::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbox message status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
    Compensated,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
        }
    }

    /// Parse a status column value. Unknown text is corruption, not a default.
    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "compensated" => Ok(Self::Compensated),
            other => Err(StoreError::InvalidData(format!(
                "unknown outbox status: {other}"
            ))),
        }
    }
}

/// Consumption record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumptionStatus {
    Processing,
    Processed,
    Failed,
    Compensated,
}

impl ConsumptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
        }
    }

    pub fn parse(s: &str) -> StoreResult<Self> {
        match s {
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "compensated" => Ok(Self::Compensated),
            other => Err(StoreError::InvalidData(format!(
                "unknown consumption status: {other}"
            ))),
        }
    }
}

/// A message staged for the outbox, not yet persisted.
///
/// Created by the producer at `prepare` time; `status` is always `pending`
/// and `retry_count` zero on insert, so neither is a field here.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub message_id: String,
    pub topic: String,
    /// Serialized JSON payload.
    pub payload: String,
    /// Serialized JSON broker hints, if any.
    pub options: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An outbox row as read from the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: i64,
    pub message_id: String,
    pub topic: String,
    pub payload: String,
    pub options: Option<String>,
    pub status: OutboxStatus,
    pub error: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A consumption ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub id: i64,
    pub message_id: String,
    pub topic: Option<String>,
    pub payload: Option<String>,
    pub status: ConsumptionStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parse an RFC 3339 timestamp column, falling back to the epoch on garbage.
pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_status_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Sent,
            OutboxStatus::Failed,
            OutboxStatus::Compensated,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn consumption_status_round_trip() {
        for status in [
            ConsumptionStatus::Processing,
            ConsumptionStatus::Processed,
            ConsumptionStatus::Failed,
            ConsumptionStatus::Compensated,
        ] {
            assert_eq!(ConsumptionStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!(OutboxStatus::parse("shipped").is_err());
        assert!(ConsumptionStatus::parse("done").is_err());
    }

    #[test]
    fn parse_datetime_tolerates_garbage() {
        let dt = parse_datetime("not a timestamp".to_string());
        assert_eq!(dt, DateTime::<Utc>::UNIX_EPOCH);

        let now = Utc::now();
        let round = parse_datetime(now.to_rfc3339());
        assert_eq!(round, now);
    }
}
