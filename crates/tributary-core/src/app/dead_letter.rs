//! DeadLetterLog - items the pipeline gave up on, kept for manual inspection.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::error;

use crate::domain::{DeadLetter, ErrorKind, MessageId};
use crate::ports::{Broker, BrokerError};

/// `last_error` of a dead letter filed for an item whose final delivery expired.
pub const ACK_WAIT_EXPIRED: &str = "ack wait expired on final delivery";

/// Shared between consumer workers (writers) and the status monitor (reader).
///
/// Held in memory for the life of the process; nothing is ever dropped from it.
#[derive(Default)]
pub struct DeadLetterLog {
    entries: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the item already has a dead letter.
    pub fn record(&self, dead_letter: DeadLetter) -> bool {
        let mut entries = self.lock();
        if entries.iter().any(|d| d.item.id() == dead_letter.item.id()) {
            return false;
        }
        entries.push(dead_letter);
        true
    }

    /// File a dead letter for every item the broker exhausted on its own,
    /// i.e. whose final delivery expired unsettled. Returns how many were new.
    pub async fn collect_exhausted(
        &self,
        broker: &dyn Broker,
        stream: &str,
        consumer: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, BrokerError> {
        let mut filed = 0;
        for exhausted in broker.take_exhausted(stream, consumer).await? {
            let message_id = exhausted.item.id();
            error!(
                %message_id,
                attempts = exhausted.deliveries,
                kind = ErrorKind::Exhausted.as_str(),
                "final delivery expired, item dead-lettered"
            );
            let dead_letter =
                DeadLetter::new(exhausted.item, exhausted.deliveries, ACK_WAIT_EXPIRED, at);
            if self.record(dead_letter) {
                filed += 1;
            }
        }
        Ok(filed)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Snapshot of every dead letter so far, oldest first.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.lock().clone()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.lock().iter().any(|d| d.item.id() == id)
    }

    // A poisoned lock only means a writer panicked mid-push; the Vec is still valid.
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetter>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Item, Subject};
    use crate::impls::InMemoryBroker;
    use crate::ports::{ConsumerConfig, StreamConfig};
    use std::time::Duration;
    use ulid::Ulid;

    fn item() -> Item {
        Item::new(
            MessageId::from_ulid(Ulid::new()),
            Subject::new("entries.new"),
            Vec::new(),
            Utc::now(),
        )
    }

    #[test]
    fn records_are_listed_in_order() {
        let log = DeadLetterLog::new();
        assert!(log.is_empty());

        let ids: Vec<MessageId> = (0..3).map(|_| MessageId::from_ulid(Ulid::new())).collect();
        for id in &ids {
            let item = Item::new(*id, Subject::new("entries.new"), Vec::new(), Utc::now());
            assert!(log.record(DeadLetter::new(item, 3, "boom", Utc::now())));
        }

        assert_eq!(log.count(), 3);
        assert!(log.contains(ids[1]));
        let listed: Vec<MessageId> = log.entries().iter().map(|d| d.item.id()).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn an_item_is_dead_lettered_at_most_once() {
        let log = DeadLetterLog::new();
        let item = item();

        assert!(log.record(DeadLetter::new(item.clone(), 3, "boom", Utc::now())));
        assert!(!log.record(DeadLetter::new(item, 3, ACK_WAIT_EXPIRED, Utc::now())));
        assert_eq!(log.count(), 1);
        assert_eq!(log.entries()[0].last_error, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn collects_items_whose_final_delivery_expired() {
        let broker = InMemoryBroker::new();
        broker
            .create_stream(&StreamConfig::new("ENTRIES", vec!["entries.>".to_string()]))
            .await
            .unwrap();
        let mut config = ConsumerConfig::new("ingest", "entries.>").with_ack_wait(Duration::from_secs(5));
        config.max_deliver = 1;
        broker.upsert_consumer("ENTRIES", &config).await.unwrap();

        let abandoned = item();
        broker.publish(abandoned.clone()).await.unwrap();
        let delivery = broker
            .next_delivery("ENTRIES", "ingest", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        drop(delivery);

        let log = DeadLetterLog::new();
        let at = Utc::now();
        // still within ack wait
        assert_eq!(log.collect_exhausted(&broker, "ENTRIES", "ingest", at).await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(log.collect_exhausted(&broker, "ENTRIES", "ingest", at).await.unwrap(), 1);
        assert_eq!(log.collect_exhausted(&broker, "ENTRIES", "ingest", at).await.unwrap(), 0);

        let dead = log.entries();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].item, abandoned);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(dead[0].last_error, ACK_WAIT_EXPIRED);
        assert_eq!(dead[0].dead_lettered_at, at);
    }
}
