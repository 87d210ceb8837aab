//! Delivery attempt: one hand-out of an item to the consumer and what came of it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::Item;

/// Outcome of a delivery attempt.
///
/// State transitions:
/// - Pending -> Acked
/// - Pending -> Nacked (redelivered later as a new attempt)
/// - Pending -> DeadLettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Handed to the handler, no verdict yet.
    Pending,

    /// Handler succeeded, the broker removed the item.
    Acked,

    /// Handler failed, a redelivery is scheduled.
    Nacked,

    /// Deliveries exhausted, the item left the active queue.
    DeadLettered,
}

impl AttemptOutcome {
    /// Terminal for the item, not just for this attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptOutcome::Acked | AttemptOutcome::DeadLettered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Acked => "acked",
            AttemptOutcome::Nacked => "nacked",
            AttemptOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Owned by the consumer while it processes one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    item: Item,

    /// 1 for the first delivery, incremented by the broker on each redelivery.
    attempt: u32,

    /// Delay requested for the next redelivery (set once nacked).
    backoff: Option<Duration>,

    outcome: AttemptOutcome,
    last_error: Option<String>,
    started_at: Instant,
}

impl DeliveryAttempt {
    pub fn new(item: Item, attempt: u32) -> Self {
        Self {
            item,
            attempt: attempt.max(1),
            backoff: None,
            outcome: AttemptOutcome::Pending,
            last_error: None,
            started_at: Instant::now(),
        }
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn backoff(&self) -> Option<Duration> {
        self.backoff
    }

    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn mark_acked(&mut self) {
        self.outcome = AttemptOutcome::Acked;
    }

    pub fn mark_nacked(&mut self, backoff: Duration, error: String) {
        self.outcome = AttemptOutcome::Nacked;
        self.backoff = Some(backoff);
        self.last_error = Some(error);
    }

    pub fn mark_dead_lettered(&mut self, error: String) {
        self.outcome = AttemptOutcome::DeadLettered;
        self.last_error = Some(error);
    }

    /// Consume the attempt, keeping the item (used when filing a dead letter).
    pub fn into_item(self) -> Item {
        self.item
    }
}
