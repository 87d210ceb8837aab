//! StreamConsumer - pull, handle, settle.
//!
//! # Flow per delivery
//! 1. `Broker::next_delivery` hands out the next item (bounded wait)
//! 2. the handler runs under `handler_timeout`; a panic is caught and treated
//!    like any other handler failure
//! 3. success acks; failure asks the `RedeliveryPolicy`, which either naks
//!    with a delay or terms the delivery and files a dead letter
//! 4. items the broker exhausted on its own (final delivery expired) are
//!    collected into the dead-letter log
//!
//! Handler errors never leave the loop. Only fatal broker errors (connection
//! lost, stream or consumer gone) end it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dead_letter::DeadLetterLog;
use super::handler::Handler;
use crate::domain::{
    DeadLetter, DeliveryAttempt, ErrorKind, HandlerError, NextAction, RedeliveryPolicy,
};
use crate::error::ConsumeError;
use crate::ports::{Broker, BrokerError, Clock, Delivery, SystemClock};

/// Pause after a non-fatal fetch error so a misbehaving broker is not hammered.
const FETCH_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Per-loop counters, merged across workers at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub acked: u64,
    pub nacked: u64,
    pub dead_lettered: u64,

    /// Settlements the broker refused (delivery already expired).
    pub stale_settlements: u64,
}

impl ConsumeStats {
    fn merge(&mut self, other: ConsumeStats) {
        self.acked += other.acked;
        self.nacked += other.nacked;
        self.dead_lettered += other.dead_lettered;
        self.stale_settlements += other.stale_settlements;
    }
}

/// A durable consumer bound to one stream, plus the policy it applies.
pub struct StreamConsumer {
    broker: Arc<dyn Broker>,
    stream: String,
    consumer: String,
    policy: RedeliveryPolicy,
    dead_letters: Arc<DeadLetterLog>,
    clock: Arc<dyn Clock>,
    handler_timeout: Duration,
    fetch_wait: Duration,
}

impl StreamConsumer {
    /// Defaults: fresh dead-letter log, system clock, 10s handler timeout, 1s fetch wait.
    pub fn new(
        broker: Arc<dyn Broker>,
        stream: impl Into<String>,
        consumer: impl Into<String>,
        policy: RedeliveryPolicy,
    ) -> Self {
        Self {
            broker,
            stream: stream.into(),
            consumer: consumer.into(),
            policy,
            dead_letters: Arc::new(DeadLetterLog::new()),
            clock: Arc::new(SystemClock),
            handler_timeout: Duration::from_secs(10),
            fetch_wait: Duration::from_secs(1),
        }
    }

    pub fn with_dead_letters(mut self, dead_letters: Arc<DeadLetterLog>) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_fetch_wait(mut self, fetch_wait: Duration) -> Self {
        self.fetch_wait = fetch_wait;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterLog> {
        &self.dead_letters
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// A delivery already handed to the handler is always settled before the
    /// loop exits.
    pub async fn consume(
        &self,
        handler: &dyn Handler,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConsumeStats, ConsumeError> {
        let mut stats = ConsumeStats::default();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = self.broker.next_delivery(&self.stream, &self.consumer, self.fetch_wait) => next,
            };

            let result = match next {
                Ok(Some(delivery)) => {
                    self.process(delivery, handler, &mut stats).await?;
                    self.collect_exhausted(&mut stats).await
                }
                Ok(None) => self.collect_exhausted(&mut stats).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(stream = %self.stream, consumer = %self.consumer, error = %e, "consume loop stopped");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(stream = %self.stream, consumer = %self.consumer, error = %e, "broker call failed, retrying");
                    tokio::time::sleep(FETCH_ERROR_PAUSE).await;
                }
            }
        }

        Ok(stats)
    }

    async fn process(
        &self,
        delivery: Box<dyn Delivery>,
        handler: &dyn Handler,
        stats: &mut ConsumeStats,
    ) -> Result<(), ConsumeError> {
        let mut attempt = DeliveryAttempt::new(delivery.item().clone(), delivery.attempt());
        let message_id = attempt.item().id();

        let handled = AssertUnwindSafe(handler.handle(attempt.item())).catch_unwind();
        let result = match tokio::time::timeout(self.handler_timeout, handled).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(&*panic))),
            Err(_) => Err(HandlerError::TimedOut(self.handler_timeout)),
        };

        let err = match result {
            Ok(()) => {
                if self.settle(delivery.ack().await, stats)? {
                    attempt.mark_acked();
                    stats.acked += 1;
                    debug!(
                        %message_id,
                        attempt = attempt.attempt(),
                        elapsed_ms = attempt.elapsed().as_millis() as u64,
                        "item acked"
                    );
                }
                return Ok(());
            }
            Err(err) => err,
        };

        match self.policy.next_action(attempt.attempt()) {
            NextAction::Retry(delay) => {
                warn!(
                    %message_id,
                    attempt = attempt.attempt(),
                    max_deliver = self.policy.max_deliver(),
                    retry_in_ms = delay.as_millis() as u64,
                    kind = err.kind().as_str(),
                    error = %err,
                    "handler failed, redelivery scheduled"
                );
                if self.settle(delivery.nak(delay).await, stats)? {
                    attempt.mark_nacked(delay, err.to_string());
                    stats.nacked += 1;
                }
            }
            NextAction::DeadLetter => {
                // A stale term means the final delivery already expired; the
                // broker hands that item to `collect_exhausted` instead.
                if !self.settle(delivery.term().await, stats)? {
                    return Ok(());
                }
                attempt.mark_dead_lettered(err.to_string());
                let attempts = attempt.attempt();
                error!(
                    %message_id,
                    attempts,
                    kind = ErrorKind::Exhausted.as_str(),
                    error = %err,
                    "deliveries exhausted, item dead-lettered"
                );
                if self.dead_letters.record(DeadLetter::new(
                    attempt.into_item(),
                    attempts,
                    err.to_string(),
                    self.clock.now(),
                )) {
                    stats.dead_lettered += 1;
                }
            }
        }
        Ok(())
    }

    async fn collect_exhausted(&self, stats: &mut ConsumeStats) -> Result<(), BrokerError> {
        stats.dead_lettered += self
            .dead_letters
            .collect_exhausted(
                self.broker.as_ref(),
                &self.stream,
                &self.consumer,
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    /// `Ok(true)` if the broker accepted the settlement, `Ok(false)` if it was stale.
    fn settle(
        &self,
        result: Result<(), BrokerError>,
        stats: &mut ConsumeStats,
    ) -> Result<bool, ConsumeError> {
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(stream = %self.stream, consumer = %self.consumer, error = %e, "settlement rejected");
                stats.stale_settlements += 1;
                Ok(false)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Raises the group's stop signal if a worker task unwinds.
struct StopOnUnwind(Arc<watch::Sender<bool>>);

impl Drop for StopOnUnwind {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let _ = self.0.send(true);
        }
    }
}

/// Outcome of a graceful stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stats: ConsumeStats,

    /// Workers still busy when the grace period ran out.
    pub aborted: usize,
}

/// `n` consume loops on the same durable consumer.
///
/// - `request_shutdown` stops every worker from pulling new deliveries
/// - a worker that hits a fatal error raises the same signal, stopping the rest
/// - `shutdown_and_join` waits for in-flight handlers, up to a grace period
pub struct ConsumerGroup {
    shutdown_tx: Arc<watch::Sender<bool>>,
    joins: Vec<JoinHandle<Result<ConsumeStats, ConsumeError>>>,
}

impl ConsumerGroup {
    pub fn spawn(n: usize, consumer: Arc<StreamConsumer>, handler: Arc<dyn Handler>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let consumer = Arc::clone(&consumer);
            let handler = Arc::clone(&handler);
            let tx = Arc::clone(&shutdown_tx);
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                let _stop_on_unwind = StopOnUnwind(Arc::clone(&tx));
                debug!(worker_id, "consumer worker started");
                let result = consumer.consume(handler.as_ref(), &mut rx).await;
                if result.is_err() {
                    let _ = tx.send(true);
                }
                debug!(worker_id, "consumer worker stopped");
                result
            }));
        }

        info!(
            workers = n,
            stream = %consumer.stream(),
            consumer = %consumer.consumer(),
            "consumer group started"
        );
        Self { shutdown_tx, joins }
    }

    /// Receiver for the group's stop signal, for tasks that should stop with it.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        // ignore send error: every receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop, then wait up to `grace` for workers to settle what they hold.
    ///
    /// Workers still running after `grace` are aborted; their deliveries stay
    /// unsettled and come back after the broker's ack wait. Returns the first
    /// worker error, if any.
    pub async fn shutdown_and_join(self, grace: Duration) -> Result<ShutdownReport, ConsumeError> {
        self.request_shutdown();
        let deadline = tokio::time::Instant::now() + grace;

        let mut report = ShutdownReport::default();
        let mut first_err = None;
        for (worker_id, mut join) in self.joins.into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut join).await {
                Ok(Ok(Ok(stats))) => report.stats.merge(stats),
                Ok(Ok(Err(e))) => {
                    first_err.get_or_insert(e);
                }
                Ok(Err(join_err)) => {
                    error!(worker_id, error = %join_err, "consumer worker panicked");
                    first_err.get_or_insert(ConsumeError::WorkerPanicked(worker_id));
                }
                Err(_) => {
                    warn!(worker_id, ?grace, "worker did not drain in time, aborting");
                    join.abort();
                    report.aborted += 1;
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!(
                    acked = report.stats.acked,
                    nacked = report.stats.nacked,
                    dead_lettered = report.stats.dead_lettered,
                    aborted = report.aborted,
                    "consumer group stopped"
                );
                Ok(report)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dead_letter::ACK_WAIT_EXPIRED;
    use crate::domain::{Item, MessageId, Subject};
    use crate::impls::InMemoryBroker;
    use crate::ports::{ConsumerConfig, FixedClock, StreamConfig};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use ulid::Ulid;

    const STREAM: &str = "ENTRIES";
    const CONSUMER: &str = "ingest";

    struct FailFirst {
        remaining: AtomicU32,
        calls: AtomicU32,
    }

    impl FailFirst {
        fn new(n: u32) -> Self {
            Self {
                remaining: AtomicU32::new(n),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Handler for FailFirst {
        async fn handle(&self, _item: &Item) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(HandlerError::rejected(format!("intentional failure (left={left})")));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct PanicFirst {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Handler for PanicFirst {
        async fn handle(&self, _item: &Item) -> Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("handler blew up");
            }
            Ok(())
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl Handler for Sleepy {
        async fn handle(&self, _item: &Item) -> Result<(), HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    async fn setup(policy: &RedeliveryPolicy) -> (Arc<InMemoryBroker>, Arc<StreamConsumer>) {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .create_stream(&StreamConfig::new(STREAM, vec!["entries.>".to_string()]))
            .await
            .unwrap();
        broker
            .upsert_consumer(
                STREAM,
                &ConsumerConfig::new(CONSUMER, "entries.>").with_policy(policy),
            )
            .await
            .unwrap();

        let consumer = Arc::new(
            StreamConsumer::new(broker.clone(), STREAM, CONSUMER, policy.clone())
                .with_clock(Arc::new(FixedClock::new(Utc::now())))
                .with_handler_timeout(Duration::from_secs(5))
                .with_fetch_wait(Duration::from_millis(50)),
        );
        (broker, consumer)
    }

    async fn publish(broker: &InMemoryBroker) -> MessageId {
        let id = MessageId::from_ulid(Ulid::new());
        broker
            .publish(Item::new(id, Subject::new("entries.new"), b"{}".to_vec(), Utc::now()))
            .await
            .unwrap();
        id
    }

    async fn wait_until_settled(broker: &InMemoryBroker) {
        loop {
            let info = broker.consumer_info(STREAM, CONSUMER).await.unwrap();
            if info.num_pending == 0 && info.num_ack_pending == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_item_is_retried_then_acked() {
        let policy = RedeliveryPolicy::default();
        let (broker, consumer) = setup(&policy).await;
        publish(&broker).await;

        let handler = Arc::new(FailFirst::new(2));
        let group = ConsumerGroup::spawn(1, consumer.clone(), handler.clone());
        wait_until_settled(&broker).await;
        let report = group.shutdown_and_join(Duration::from_secs(1)).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.stats.nacked, 2);
        assert_eq!(report.stats.acked, 1);
        assert!(consumer.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_item_is_dead_lettered_once() {
        let policy = RedeliveryPolicy::default();
        let (broker, consumer) = setup(&policy).await;
        let id = publish(&broker).await;

        let group = ConsumerGroup::spawn(1, consumer.clone(), Arc::new(FailFirst::new(u32::MAX)));
        wait_until_settled(&broker).await;
        let report = group.shutdown_and_join(Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.stats.dead_lettered, 1);
        assert_eq!(report.stats.acked, 0);
        let dead = consumer.dead_letters().entries();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].item.id(), id);
        assert_eq!(dead[0].attempts, 3);

        let info = broker.consumer_info(STREAM, CONSUMER).await.unwrap();
        assert_eq!(info.num_terminated, 1);
        assert_eq!(info.num_acked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_timeout_counts_as_failure() {
        let policy = RedeliveryPolicy::new(1, vec![]).unwrap();
        let (broker, consumer) = setup(&policy).await;
        publish(&broker).await;

        let group = ConsumerGroup::spawn(1, consumer.clone(), Arc::new(Sleepy(Duration::from_secs(60))));
        wait_until_settled(&broker).await;
        group.shutdown_and_join(Duration::from_secs(1)).await.unwrap();

        let dead = consumer.dead_letters().entries();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].last_error.contains("timed out"));
    }

    #[tokio::test]
    async fn lost_connection_stops_the_group_with_an_error() {
        let (broker, consumer) = setup(&RedeliveryPolicy::default()).await;
        let group = ConsumerGroup::spawn(2, consumer, Arc::new(FailFirst::new(0)));
        let mut signal = group.shutdown_signal();

        broker.disconnect().await;
        signal.wait_for(|stop| *stop).await.unwrap();

        let err = group.shutdown_and_join(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ConsumeError::Broker(BrokerError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_handler_finishes_before_shutdown_completes() {
        let (broker, consumer) = setup(&RedeliveryPolicy::default()).await;
        publish(&broker).await;

        let group = ConsumerGroup::spawn(1, consumer, Arc::new(Sleepy(Duration::from_secs(2))));
        // let the worker pick the item up
        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = group.shutdown_and_join(Duration::from_secs(5)).await.unwrap();

        assert_eq!(report.stats.acked, 1);
        assert_eq!(report.aborted, 0);
        let info = broker.consumer_info(STREAM, CONSUMER).await.unwrap();
        assert_eq!(info.num_acked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_past_grace_is_aborted_and_item_stays_in_flight() {
        let (broker, consumer) = setup(&RedeliveryPolicy::default()).await;
        publish(&broker).await;

        let group = ConsumerGroup::spawn(1, consumer, Arc::new(Sleepy(Duration::from_secs(4))));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = group.shutdown_and_join(Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.aborted, 1);
        let info = broker.consumer_info(STREAM, CONSUMER).await.unwrap();
        assert_eq!(info.num_ack_pending, 1);
        assert_eq!(info.num_acked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_panic_is_retried_and_worker_keeps_consuming() {
        let policy = RedeliveryPolicy::new(3, vec![Duration::from_secs(1)]).unwrap();
        let (broker, consumer) = setup(&policy).await;
        publish(&broker).await;

        let handler = Arc::new(PanicFirst::default());
        let group = ConsumerGroup::spawn(1, consumer.clone(), handler.clone());
        let signal = group.shutdown_signal();

        tokio::time::sleep(Duration::from_millis(100)).await;
        publish(&broker).await;
        wait_until_settled(&broker).await;

        assert!(!*signal.borrow());
        let report = group.shutdown_and_join(Duration::from_secs(1)).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.stats.nacked, 1);
        assert_eq!(report.stats.acked, 2);
        assert!(consumer.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn handler_panic_on_final_delivery_is_dead_lettered() {
        let policy = RedeliveryPolicy::new(1, vec![]).unwrap();
        let (broker, consumer) = setup(&policy).await;
        let id = publish(&broker).await;

        let group = ConsumerGroup::spawn(1, consumer.clone(), Arc::new(PanicFirst::default()));
        wait_until_settled(&broker).await;
        let report = group.shutdown_and_join(Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.stats.dead_lettered, 1);
        let dead = consumer.dead_letters().entries();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].item.id(), id);
        assert_eq!(dead[0].last_error, "handler panicked: handler blew up");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_final_delivery_is_collected_as_dead_letter() {
        let policy = RedeliveryPolicy::new(1, vec![]).unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .create_stream(&StreamConfig::new(STREAM, vec!["entries.>".to_string()]))
            .await
            .unwrap();
        let config = ConsumerConfig::new(CONSUMER, "entries.>")
            .with_policy(&policy)
            .with_ack_wait(Duration::from_secs(5));
        broker.upsert_consumer(STREAM, &config).await.unwrap();
        let consumer = Arc::new(
            StreamConsumer::new(broker.clone(), STREAM, CONSUMER, policy)
                .with_fetch_wait(Duration::from_millis(50)),
        );

        // a previous holder took the only delivery and never settled it
        let id = publish(&broker).await;
        let abandoned = broker
            .next_delivery(STREAM, CONSUMER, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        drop(abandoned);

        let group = ConsumerGroup::spawn(1, consumer.clone(), Arc::new(FailFirst::new(0)));
        tokio::time::sleep(Duration::from_secs(6)).await;
        let report = group.shutdown_and_join(Duration::from_secs(1)).await.unwrap();

        assert_eq!(report.stats.dead_lettered, 1);
        assert!(consumer.dead_letters().contains(id));
        assert_eq!(consumer.dead_letters().entries()[0].last_error, ACK_WAIT_EXPIRED);
        let info = broker.consumer_info(STREAM, CONSUMER).await.unwrap();
        assert_eq!(info.num_exhausted, 0);
        assert_eq!(info.num_pending + info.num_ack_pending, 0);
    }
}
