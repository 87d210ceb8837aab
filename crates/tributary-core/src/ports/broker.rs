//! Broker port - durable, at-least-once work queue.
//!
//! The broker owns delivery state: which items are pending, which are handed
//! out and awaiting an ack, and how many times each has been delivered. The
//! consumer only ever holds a `Delivery` handle and settles it exactly once.
//!
//! # Work-queue semantics
//! - an item is handed to one consumer at a time
//! - `ack` removes it for good, `nak(delay)` schedules a redelivery, `term` drops it
//! - a delivery not settled within `ack_wait` is redelivered, or, once
//!   `max_deliver` deliveries have been made, moved to the consumer's exhausted
//!   list until someone calls `take_exhausted`

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DeliveryId, ErrorKind, Item, MessageId, RedeliveryPolicy};

/// Stream definition: a named log bound to one or more subject filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
        }
    }
}

/// Durable consumer with explicit acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,

    /// How long a delivery may stay unsettled before the broker takes it back.
    pub ack_wait: Duration,

    /// Upper bound on deliveries per item (first delivery included).
    pub max_deliver: u32,

    /// Delays the broker applies to redeliveries after an ack-wait expiry.
    pub backoff: Vec<Duration>,

    /// Maximum number of deliveries awaiting settlement at once.
    pub max_ack_pending: usize,
}

impl ConsumerConfig {
    pub fn new(durable_name: impl Into<String>, filter_subject: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            filter_subject: filter_subject.into(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
            backoff: Vec::new(),
            max_ack_pending: 1000,
        }
    }

    /// Align broker-side limits with the consumer's redelivery policy.
    pub fn with_policy(mut self, policy: &RedeliveryPolicy) -> Self {
        self.max_deliver = policy.max_deliver();
        self.backoff = policy.backoff().to_vec();
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_ack_pending(mut self, max_ack_pending: usize) -> Self {
        self.max_ack_pending = max_ack_pending;
        self
    }
}

/// Broker confirmation of a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    pub id: MessageId,
}

/// Point-in-time view of a durable consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream: String,
    pub consumer: String,

    /// Items waiting for their first delivery or for a scheduled redelivery.
    pub num_pending: u64,

    /// Items handed out and not yet settled.
    pub num_ack_pending: u64,

    /// Total redeliveries made so far.
    pub num_redelivered: u64,

    pub num_acked: u64,

    /// Items removed without an ack (term, or `max_deliver` reached on expiry).
    pub num_terminated: u64,

    /// Items whose final delivery expired and that nobody has collected yet.
    pub num_exhausted: u64,
}

/// An item the broker gave up on after its last delivery expired unsettled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExhaustedItem {
    pub item: Item,
    pub deliveries: u32,
}

/// Point-in-time view of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,

    /// Items currently retained (not yet acked or terminated).
    pub messages: u64,

    /// Sequence number the next publish will get.
    pub next_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Connection(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("stream already exists: {0}")]
    StreamExists(String),

    #[error("consumer not found: {stream}/{consumer}")]
    ConsumerNotFound { stream: String, consumer: String },

    #[error("no stream accepts subject {0}")]
    NoStreamForSubject(String),

    #[error("invalid subject {0:?}")]
    InvalidSubject(String),

    #[error("delivery {0} is no longer in flight")]
    DeliveryExpired(DeliveryId),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Connection(_) => ErrorKind::Connectivity,
            BrokerError::DeliveryExpired(_) => ErrorKind::Transient,
            BrokerError::StreamNotFound(_)
            | BrokerError::StreamExists(_)
            | BrokerError::ConsumerNotFound { .. }
            | BrokerError::NoStreamForSubject(_)
            | BrokerError::InvalidSubject(_) => ErrorKind::Configuration,
        }
    }

    /// Errors after which a consume loop cannot make progress.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::StreamNotFound(_)
                | BrokerError::ConsumerNotFound { .. }
        )
    }
}

/// One hand-out of an item. Must be settled exactly once.
///
/// Dropping it unsettled leaves the item in flight until `ack_wait` expires.
#[async_trait]
pub trait Delivery: Send {
    fn item(&self) -> &Item;

    /// 1-indexed delivery count of this item.
    fn attempt(&self) -> u32;

    fn delivery_id(&self) -> DeliveryId;

    /// Processing succeeded: remove the item permanently.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Processing failed: redeliver after `delay`.
    async fn nak(self: Box<Self>, delay: Duration) -> Result<(), BrokerError>;

    /// Stop redelivering: remove the item without acking it.
    async fn term(self: Box<Self>) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Fails with `StreamExists` if a stream of that name is already defined.
    async fn create_stream(&self, config: &StreamConfig) -> Result<(), BrokerError>;

    /// Returns whether a stream was removed.
    async fn delete_stream(&self, name: &str) -> Result<bool, BrokerError>;

    async fn stream_exists(&self, name: &str) -> Result<bool, BrokerError>;

    /// Create the durable consumer, or update the limits of an existing one.
    async fn upsert_consumer(&self, stream: &str, config: &ConsumerConfig)
    -> Result<(), BrokerError>;

    async fn publish(&self, item: Item) -> Result<PublishAck, BrokerError>;

    /// Wait up to `wait` for the next delivery. `Ok(None)` means nothing arrived in time.
    async fn next_delivery(
        &self,
        stream: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, BrokerError>;

    async fn consumer_info(&self, stream: &str, consumer: &str)
    -> Result<ConsumerInfo, BrokerError>;

    /// Drain items whose final delivery expired. Each item is returned once.
    async fn take_exhausted(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<Vec<ExhaustedItem>, BrokerError>;

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError>;
}
