use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Item;

/// An item that exhausted its deliveries and was set aside for manual handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: Item,

    /// Number of deliveries the item received.
    pub attempts: u32,

    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        item: Item,
        attempts: u32,
        last_error: impl Into<String>,
        dead_lettered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            item,
            attempts,
            last_error: last_error.into(),
            dead_lettered_at,
        }
    }
}
