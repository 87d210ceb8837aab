//! Stored record: what the sink leaves behind for each acked item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Item, MessageId, Subject};

/// Uniqueness key of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<MessageId> for RecordKey {
    fn from(id: MessageId) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One durable row per successfully processed item.
///
/// Rows are append-only: a record is never updated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: RecordKey,
    pub subject: Subject,
    pub payload: Vec<u8>,

    /// Publish timestamp of the item (the `timestamp` column).
    pub timestamp: DateTime<Utc>,
}

impl StoredRecord {
    pub fn from_item(item: &Item) -> Self {
        Self {
            key: item.idempotency_key(),
            subject: item.subject().clone(),
            payload: item.payload().to_vec(),
            timestamp: item.published_at(),
        }
    }
}
