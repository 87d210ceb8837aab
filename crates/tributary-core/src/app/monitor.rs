//! StatusMonitor - periodic view of the consumer's backlog.
//!
//! Runs beside the consume path and never touches deliveries. Each tick emits
//! one status line and publishes the snapshot on a `watch` channel. Items the
//! broker exhausted on its own are filed in the dead-letter log before counting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::dead_letter::DeadLetterLog;
use crate::observability::StatusSnapshot;
use crate::ports::{Broker, BrokerError, Clock, SystemClock};

/// Shortest sampling interval; smaller values are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct StatusMonitor {
    broker: Arc<dyn Broker>,
    stream: String,
    consumer: String,
    dead_letters: Arc<DeadLetterLog>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl StatusMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        stream: impl Into<String>,
        consumer: impl Into<String>,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        Self {
            broker,
            stream: stream.into(),
            consumer: consumer.into(),
            dead_letters,
            clock: Arc::new(SystemClock),
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Values below `MIN_INTERVAL` (zero included) are raised to it.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn sample(&self) -> Result<StatusSnapshot, BrokerError> {
        self.dead_letters
            .collect_exhausted(
                self.broker.as_ref(),
                &self.stream,
                &self.consumer,
                self.clock.now(),
            )
            .await?;
        let info = self.broker.consumer_info(&self.stream, &self.consumer).await?;
        Ok(StatusSnapshot {
            stream: info.stream,
            consumer: info.consumer,
            pending: info.num_pending,
            in_flight: info.num_ack_pending,
            redeliveries: info.num_redelivered,
            acked: info.num_acked,
            dead_lettered: self.dead_letters.count() as u64,
            sampled_at: self.clock.now(),
        })
    }

    /// Sample every interval until `shutdown` flips to true.
    ///
    /// The first sample is taken immediately. Ticks missed while a sample was
    /// slow are skipped, not replayed.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> MonitorHandle {
        let (latest_tx, latest_rx) = watch::channel(None);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

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
                    _ = ticker.tick() => match self.sample().await {
                        Ok(snapshot) => {
                            info!(
                                pending = snapshot.pending,
                                in_flight = snapshot.in_flight,
                                redeliveries = snapshot.redeliveries,
                                dead_lettered = snapshot.dead_lettered,
                                "status {snapshot}"
                            );
                            latest_tx.send_replace(Some(snapshot));
                        }
                        Err(e) => {
                            warn!(stream = %self.stream, consumer = %self.consumer, error = %e, "status sample failed");
                        }
                    },
                }
            }
            debug!(stream = %self.stream, "status monitor stopped");
        });

        MonitorHandle {
            latest: latest_rx,
            join,
        }
    }
}

/// Handle to a running monitor.
pub struct MonitorHandle {
    latest: watch::Receiver<Option<StatusSnapshot>>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Most recent snapshot, if a sample has succeeded yet.
    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StatusSnapshot>> {
        self.latest.clone()
    }

    /// Wait for the monitor task to exit. Stop it first through its shutdown signal.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!(error = %e, "status monitor task failed");
        }
    }
}
