//! InMemoryBroker - work-queue broker for tests and the demo binary.
//!
//! # Implementation details
//! - streams hold items by sequence number until acked or terminated
//! - each durable consumer keeps its own ready queue, a min-heap of scheduled
//!   redeliveries, and the set of in-flight deliveries with their ack deadlines
//! - waiting consumers park on a `Notify`; every state change wakes them
//! - time is `tokio::time::Instant`, so paused-clock tests drive backoff

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{DeliveryId, Item};
use crate::ports::{
    Broker, BrokerError, ConsumerConfig, ConsumerInfo, Delivery, ExhaustedItem, IdGenerator,
    PublishAck, StreamConfig, StreamInfo, SystemClock, UlidGenerator,
};

/// Scheduled redelivery. Reverse ordering turns `BinaryHeap` into a min-heap.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    at: Instant,
    seq: u64,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    delivery_id: DeliveryId,
    deadline: Instant,
}

struct ConsumerState {
    config: ConsumerConfig,
    ready: VecDeque<u64>,
    scheduled: BinaryHeap<Scheduled>,
    in_flight: HashMap<u64, InFlight>,

    /// Delivery count per sequence.
    deliveries: HashMap<u64, u32>,

    /// Items dropped after their final delivery expired, awaiting `take_exhausted`.
    exhausted: Vec<ExhaustedItem>,

    num_redelivered: u64,
    num_acked: u64,
    num_terminated: u64,
}

impl ConsumerState {
    fn new(config: ConsumerConfig, messages: &BTreeMap<u64, Item>) -> Self {
        let ready = messages
            .iter()
            .filter(|(_, item)| item.subject().matches(&config.filter_subject))
            .map(|(seq, _)| *seq)
            .collect();
        Self {
            config,
            ready,
            scheduled: BinaryHeap::new(),
            in_flight: HashMap::new(),
            deliveries: HashMap::new(),
            exhausted: Vec::new(),
            num_redelivered: 0,
            num_acked: 0,
            num_terminated: 0,
        }
    }

    /// Broker-side delay for a redelivery after an ack-wait expiry.
    fn expiry_backoff(&self, deliveries: u32) -> Duration {
        let idx = deliveries.saturating_sub(1) as usize;
        self.config
            .backoff
            .get(idx)
            .or_else(|| self.config.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    fn requeue(&mut self, seq: u64, delay: Duration, now: Instant) {
        if delay.is_zero() {
            self.ready.push_back(seq);
        } else {
            self.scheduled.push(Scheduled {
                at: now + delay,
                seq,
            });
        }
    }

    /// Take back deliveries whose ack deadline passed.
    fn reclaim_expired(&mut self, now: Instant, messages: &mut BTreeMap<u64, Item>) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in expired {
            self.in_flight.remove(&seq);
            let delivered = self.deliveries.get(&seq).copied().unwrap_or(0);
            if delivered >= self.config.max_deliver {
                warn!(
                    consumer = %self.config.durable_name,
                    seq,
                    deliveries = delivered,
                    "ack wait expired on final delivery, item exhausted"
                );
                self.deliveries.remove(&seq);
                self.num_terminated += 1;
                if let Some(item) = messages.remove(&seq) {
                    self.exhausted.push(ExhaustedItem {
                        item,
                        deliveries: delivered,
                    });
                }
            } else {
                debug!(consumer = %self.config.durable_name, seq, "ack wait expired, redelivering");
                let delay = self.expiry_backoff(delivered);
                self.requeue(seq, delay, now);
            }
        }
    }

    fn promote_scheduled(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.at > now {
                break;
            }
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.seq);
            }
        }
    }

    /// Pop the next ready sequence that still has an item behind it.
    fn pop_ready(&mut self, messages: &BTreeMap<u64, Item>) -> Option<(u64, Item)> {
        while let Some(seq) = self.ready.pop_front() {
            if self.in_flight.contains_key(&seq) {
                continue;
            }
            if let Some(item) = messages.get(&seq) {
                return Some((seq, item.clone()));
            }
        }
        None
    }

    fn start_delivery(&mut self, seq: u64, delivery_id: DeliveryId, now: Instant) -> u32 {
        let count = self.deliveries.entry(seq).or_insert(0);
        *count += 1;
        let attempt = *count;
        if attempt > 1 {
            self.num_redelivered += 1;
        }
        self.in_flight.insert(
            seq,
            InFlight {
                delivery_id,
                deadline: now + self.config.ack_wait,
            },
        );
        attempt
    }

    fn next_wake(&self) -> Option<Instant> {
        let scheduled = self.scheduled.peek().map(|s| s.at);
        let deadline = self.in_flight.values().map(|f| f.deadline).min();
        match (scheduled, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn num_pending(&self, messages: &BTreeMap<u64, Item>) -> u64 {
        let ready = self
            .ready
            .iter()
            .filter(|seq| messages.contains_key(seq) && !self.in_flight.contains_key(seq))
            .count();
        let scheduled = self
            .scheduled
            .iter()
            .filter(|s| messages.contains_key(&s.seq))
            .count();
        (ready + scheduled) as u64
    }
}

struct StreamState {
    config: StreamConfig,
    messages: BTreeMap<u64, Item>,
    next_seq: u64,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            messages: BTreeMap::new(),
            next_seq: 1,
            consumers: HashMap::new(),
        }
    }

    fn accepts(&self, item: &Item) -> bool {
        self.config
            .subjects
            .iter()
            .any(|filter| item.subject().matches(filter))
    }
}

struct BrokerState {
    streams: HashMap<String, StreamState>,
    connected: bool,
}

impl BrokerState {
    fn check_connected(&self) -> Result<(), BrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::Connection("in-memory broker disconnected".to_string()))
        }
    }

    fn stream_mut(&mut self, name: &str) -> Result<&mut StreamState, BrokerError> {
        self.check_connected()?;
        self.streams
            .get_mut(name)
            .ok_or_else(|| BrokerError::StreamNotFound(name.to_string()))
    }
}

fn consumer_not_found(stream: &str, consumer: &str) -> BrokerError {
    BrokerError::ConsumerNotFound {
        stream: stream.to_string(),
        consumer: consumer.to_string(),
    }
}

/// In-memory work-queue broker.
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                streams: HashMap::new(),
                connected: true,
            })),
            notify: Arc::new(Notify::new()),
            ids,
        }
    }

    /// Simulate losing the broker: every call fails with `Connection` until `reconnect`.
    pub async fn disconnect(&self) {
        self.state.lock().await.connected = false;
        self.notify.notify_waiters();
    }

    pub async fn reconnect(&self) {
        self.state.lock().await.connected = true;
        self.notify.notify_waiters();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn create_stream(&self, config: &StreamConfig) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.check_connected()?;
        if state.streams.contains_key(&config.name) {
            return Err(BrokerError::StreamExists(config.name.clone()));
        }
        state
            .streams
            .insert(config.name.clone(), StreamState::new(config.clone()));
        debug!(stream = %config.name, subjects = ?config.subjects, "stream created");
        Ok(())
    }

    async fn delete_stream(&self, name: &str) -> Result<bool, BrokerError> {
        let removed = {
            let mut state = self.state.lock().await;
            state.check_connected()?;
            state.streams.remove(name)
        };
        if let Some(stream) = &removed {
            debug!(stream = %name, discarded = stream.messages.len(), "stream deleted");
            self.notify.notify_waiters();
        }
        Ok(removed.is_some())
    }

    async fn stream_exists(&self, name: &str) -> Result<bool, BrokerError> {
        let state = self.state.lock().await;
        state.check_connected()?;
        Ok(state.streams.contains_key(name))
    }

    async fn upsert_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            let StreamState {
                messages,
                consumers,
                ..
            } = state.stream_mut(stream)?;
            match consumers.get_mut(&config.durable_name) {
                Some(existing) => existing.config = config.clone(),
                None => {
                    consumers.insert(
                        config.durable_name.clone(),
                        ConsumerState::new(config.clone(), messages),
                    );
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, item: Item) -> Result<PublishAck, BrokerError> {
        if !item.subject().is_literal() {
            return Err(BrokerError::InvalidSubject(item.subject().to_string()));
        }

        let ack = {
            let mut state = self.state.lock().await;
            state.check_connected()?;
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.accepts(&item))
                .ok_or_else(|| BrokerError::NoStreamForSubject(item.subject().to_string()))?;

            let seq = stream.next_seq;
            stream.next_seq += 1;
            for consumer in stream.consumers.values_mut() {
                if item.subject().matches(&consumer.config.filter_subject) {
                    consumer.ready.push_back(seq);
                }
            }
            let ack = PublishAck {
                stream: stream.config.name.clone(),
                sequence: seq,
                id: item.id(),
            };
            stream.messages.insert(seq, item);
            ack
        };

        self.notify.notify_waiters();
        Ok(ack)
    }

    async fn next_delivery(
        &self,
        stream: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, BrokerError> {
        let give_up_at = Instant::now() + wait;

        loop {
            // Register interest before inspecting state so a concurrent publish is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let StreamState {
                    messages,
                    consumers,
                    ..
                } = state.stream_mut(stream)?;
                let cs = consumers
                    .get_mut(consumer)
                    .ok_or_else(|| consumer_not_found(stream, consumer))?;

                cs.reclaim_expired(now, messages);
                cs.promote_scheduled(now);

                if cs.in_flight.len() < cs.config.max_ack_pending
                    && let Some((seq, item)) = cs.pop_ready(messages)
                {
                    let delivery_id = self.ids.generate_delivery_id();
                    let attempt = cs.start_delivery(seq, delivery_id, now);
                    let delivery = InMemoryDelivery {
                        stream: stream.to_string(),
                        consumer: consumer.to_string(),
                        seq,
                        delivery_id,
                        attempt,
                        item,
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&self.notify),
                    };
                    return Ok(Some(Box::new(delivery)));
                }

                cs.next_wake()
            };

            if Instant::now() >= give_up_at {
                return Ok(None);
            }
            let wake_at = next_wake.map_or(give_up_at, |w| w.min(give_up_at));
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<ConsumerInfo, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let StreamState {
            messages,
            consumers,
            ..
        } = state.stream_mut(stream)?;
        let cs = consumers
            .get_mut(consumer)
            .ok_or_else(|| consumer_not_found(stream, consumer))?;
        cs.reclaim_expired(now, messages);

        Ok(ConsumerInfo {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            num_pending: cs.num_pending(messages),
            num_ack_pending: cs.in_flight.len() as u64,
            num_redelivered: cs.num_redelivered,
            num_acked: cs.num_acked,
            num_terminated: cs.num_terminated,
            num_exhausted: cs.exhausted.len() as u64,
        })
    }

    async fn take_exhausted(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<Vec<ExhaustedItem>, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let StreamState {
            messages,
            consumers,
            ..
        } = state.stream_mut(stream)?;
        let cs = consumers
            .get_mut(consumer)
            .ok_or_else(|| consumer_not_found(stream, consumer))?;
        cs.reclaim_expired(now, messages);
        Ok(std::mem::take(&mut cs.exhausted))
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError> {
        let mut state = self.state.lock().await;
        let s = state.stream_mut(stream)?;
        Ok(StreamInfo {
            name: s.config.name.clone(),
            messages: s.messages.len() as u64,
            next_sequence: s.next_seq,
        })
    }
}

/// Delivery handle for `InMemoryBroker`.
struct InMemoryDelivery {
    stream: String,
    consumer: String,
    seq: u64,
    delivery_id: DeliveryId,
    attempt: u32,
    item: Item,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

enum Settle {
    Ack,
    Nak(Duration),
    Term,
}

impl InMemoryDelivery {
    async fn settle(self, how: Settle) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            let StreamState {
                messages,
                consumers,
                ..
            } = state.stream_mut(&self.stream)?;
            let cs = consumers
                .get_mut(&self.consumer)
                .ok_or_else(|| consumer_not_found(&self.stream, &self.consumer))?;

            // A delivery that expired and was handed out again is no longer ours to settle.
            match cs.in_flight.get(&self.seq) {
                Some(f) if f.delivery_id == self.delivery_id => {}
                _ => return Err(BrokerError::DeliveryExpired(self.delivery_id)),
            }
            cs.in_flight.remove(&self.seq);

            match how {
                Settle::Ack => {
                    messages.remove(&self.seq);
                    cs.deliveries.remove(&self.seq);
                    cs.num_acked += 1;
                }
                Settle::Nak(delay) => cs.requeue(self.seq, delay, Instant::now()),
                Settle::Term => {
                    messages.remove(&self.seq);
                    cs.deliveries.remove(&self.seq);
                    cs.num_terminated += 1;
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn item(&self) -> &Item {
        &self.item
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delivery_id(&self) -> DeliveryId {
        self.delivery_id
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.settle(Settle::Ack).await
    }

    async fn nak(self: Box<Self>, delay: Duration) -> Result<(), BrokerError> {
        self.settle(Settle::Nak(delay)).await
    }

    async fn term(self: Box<Self>) -> Result<(), BrokerError> {
        self.settle(Settle::Term).await
    }
}
