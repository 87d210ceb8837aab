//! Publisher - puts items onto the stream.
//!
//! `Publisher` is the one-shot API; `PublisherLoop` drives it on a fixed
//! interval (used by the demo binary to keep the stream fed).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::monitor::MIN_INTERVAL;
use crate::domain::{Item, MessageId, Subject};
use crate::ports::{Broker, BrokerError, Clock, IdGenerator, SystemClock, UlidGenerator};

pub struct Publisher {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_clock(broker, Arc::new(SystemClock))
    }

    /// Timestamps and id time parts both come from `clock`.
    pub fn with_clock(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self { broker, clock, ids }
    }

    /// Publish one item under a literal subject (no `*` or `>` tokens).
    ///
    /// No retry: a failed publish is returned as is.
    pub async fn publish(
        &self,
        subject: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<MessageId, BrokerError> {
        let subject = Subject::new(subject);
        if !subject.is_literal() {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }

        let item = Item::new(
            self.ids.generate_message_id(),
            subject,
            payload,
            self.clock.now(),
        );
        let ack = self.broker.publish(item).await?;
        debug!(message_id = %ack.id, stream = %ack.stream, sequence = ack.sequence, "published");
        Ok(ack.id)
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn publish_json<T: Serialize>(
        &self,
        subject: impl Into<String>,
        value: &T,
    ) -> Result<MessageId, PublishJsonError> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.publish(subject, payload).await?)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishJsonError {
    #[error("payload encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Payload `PublisherLoop` emits on every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickPayload {
    pub seq: u64,
    pub emitted_at: DateTime<Utc>,
}

/// Publishes one `TickPayload` per interval until stopped.
///
/// A failed tick is logged and skipped; the loop keeps going.
pub struct PublisherLoop {
    publisher: Arc<Publisher>,
    subject: String,
    interval: Duration,
}

impl PublisherLoop {
    /// `interval` is raised to `MIN_INTERVAL` if smaller.
    pub fn new(publisher: Arc<Publisher>, subject: impl Into<String>, interval: Duration) -> Self {
        Self {
            publisher,
            subject: subject.into(),
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Returns the number of items published once `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut seq = 0u64;
            let mut published = 0u64;

            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        seq += 1;
                        let payload = TickPayload {
                            seq,
                            emitted_at: self.publisher.clock().now(),
                        };
                        match self.publisher.publish_json(self.subject.as_str(), &payload).await {
                            Ok(_) => published += 1,
                            Err(e) => warn!(subject = %self.subject, seq, error = %e, "publish failed"),
                        }
                    }
                }
            }

            info!(subject = %self.subject, published, "publisher loop stopped");
            published
        })
    }
}
