//! Pipeline - wiring and startup checks.
//!
//! `PipelineBuilder::build` does everything that can fail before a single item
//! is consumed: config validation, a sink ping, the stream startup policy and
//! the durable consumer upsert. `Pipeline::start` then only spawns tasks.

use std::sync::Arc;

use tracing::{info, warn};

use super::consumer::{ConsumerGroup, ShutdownReport, StreamConsumer};
use super::dead_letter::DeadLetterLog;
use super::handler::{Handler, SinkHandler};
use super::monitor::{MonitorHandle, StatusMonitor};
use crate::config::{PipelineConfig, StartupPolicy};
use crate::error::PipelineError;
use crate::observability::StatusSnapshot;
use crate::ports::{Broker, BrokerError, Clock, Sink, SystemClock};

/// Builds a `Pipeline` from explicit collaborators.
///
/// # Example
/// ```ignore
/// let pipeline = PipelineBuilder::new(broker, sink, PipelineConfig::default())
///     .build()
///     .await?;
/// let running = pipeline.start();
/// // ...
/// let report = running.shutdown().await?;
/// ```
pub struct PipelineBuilder {
    broker: Arc<dyn Broker>,
    sink: Arc<dyn Sink>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    handler: Option<Arc<dyn Handler>>,
}

impl PipelineBuilder {
    pub fn new(broker: Arc<dyn Broker>, sink: Arc<dyn Sink>, config: PipelineConfig) -> Self {
        Self {
            broker,
            sink,
            config,
            clock: Arc::new(SystemClock),
            handler: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default handler (a `SinkHandler` over the configured sink).
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub async fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;

        if let Err(e) = self.sink.ping().await {
            warn!(error = %e, "sink unreachable at startup");
            return Err(e.into());
        }

        self.prepare_stream().await?;

        let stream = &self.config.stream.name;
        let consumer = self
            .config
            .consumer
            .to_consumer_config(&self.config.redelivery);
        self.broker.upsert_consumer(stream, &consumer).await?;
        info!(
            stream = %stream,
            consumer = %consumer.durable_name,
            filter = %consumer.filter_subject,
            max_deliver = consumer.max_deliver,
            ack_wait = ?consumer.ack_wait,
            "durable consumer ready"
        );

        let handler: Arc<dyn Handler> = match self.handler {
            Some(handler) => handler,
            None => Arc::new(SinkHandler::new(self.sink)),
        };

        Ok(Pipeline {
            broker: self.broker,
            handler,
            config: self.config,
            clock: self.clock,
            dead_letters: Arc::new(DeadLetterLog::new()),
        })
    }

    async fn prepare_stream(&self) -> Result<(), BrokerError> {
        let settings = &self.config.stream;
        let exists = self.broker.stream_exists(&settings.name).await?;

        match (exists, self.config.startup) {
            (true, StartupPolicy::Preserve) => {
                let kept = self.broker.stream_info(&settings.name).await?.messages;
                info!(stream = %settings.name, kept, "reusing existing stream");
                return Ok(());
            }
            (true, StartupPolicy::Recreate) => {
                let discarded = self.broker.stream_info(&settings.name).await?.messages;
                self.broker.delete_stream(&settings.name).await?;
                warn!(stream = %settings.name, discarded, "stream recreated, undelivered items discarded");
            }
            (false, _) => {}
        }

        self.broker
            .create_stream(&settings.to_stream_config())
            .await?;
        info!(stream = %settings.name, subjects = ?settings.subjects, "stream created");
        Ok(())
    }
}

/// A validated, wired pipeline that has not started consuming yet.
pub struct Pipeline {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn Handler>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    dead_letters: Arc<DeadLetterLog>,
}

impl Pipeline {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterLog> {
        &self.dead_letters
    }

    /// Spawn the consumer workers and, if enabled, the status monitor.
    pub fn start(self) -> RunningPipeline {
        let stream = self.config.stream.name.clone();
        let durable = self.config.consumer.durable_name.clone();

        let consumer = StreamConsumer::new(
            Arc::clone(&self.broker),
            stream.as_str(),
            durable.as_str(),
            self.config.redelivery.clone(),
        )
        .with_dead_letters(Arc::clone(&self.dead_letters))
        .with_clock(Arc::clone(&self.clock))
        .with_handler_timeout(self.config.handler_timeout)
        .with_fetch_wait(self.config.consumer.fetch_wait);

        let group = ConsumerGroup::spawn(self.config.workers, Arc::new(consumer), self.handler);

        let status = StatusMonitor::new(
            Arc::clone(&self.broker),
            stream.as_str(),
            durable.as_str(),
            Arc::clone(&self.dead_letters),
        )
        .with_clock(Arc::clone(&self.clock));

        let monitor = self.config.monitor.enabled.then(|| {
            StatusMonitor::new(
                Arc::clone(&self.broker),
                stream.as_str(),
                durable.as_str(),
                Arc::clone(&self.dead_letters),
            )
            .with_clock(Arc::clone(&self.clock))
            .with_interval(self.config.monitor.interval)
            .spawn(group.shutdown_signal())
        });

        RunningPipeline {
            group,
            monitor,
            status,
            dead_letters: self.dead_letters,
            config: self.config,
        }
    }
}

/// Handle to a started pipeline.
pub struct RunningPipeline {
    group: ConsumerGroup,
    monitor: Option<MonitorHandle>,
    status: StatusMonitor,
    dead_letters: Arc<DeadLetterLog>,
    config: PipelineConfig,
}

impl RunningPipeline {
    pub fn dead_letters(&self) -> &Arc<DeadLetterLog> {
        &self.dead_letters
    }

    /// Take a status sample now, independent of the monitor's interval.
    pub async fn sample(&self) -> Result<StatusSnapshot, BrokerError> {
        self.status.sample().await
    }

    /// Last snapshot published by the background monitor.
    pub fn latest_status(&self) -> Option<StatusSnapshot> {
        self.monitor.as_ref().and_then(MonitorHandle::latest)
    }

    /// Resolves once a stop was requested or a worker failed.
    pub async fn stopped(&self) {
        let mut signal = self.group.shutdown_signal();
        let _ = signal.wait_for(|stop| *stop).await;
    }

    /// Stop consuming, drain in-flight handlers (bounded by `shutdown_grace`)
    /// and stop the monitor.
    pub async fn shutdown(self) -> Result<ShutdownReport, PipelineError> {
        let result = self.group.shutdown_and_join(self.config.shutdown_grace).await;
        if let Some(monitor) = self.monitor {
            monitor.join().await;
        }
        Ok(result?)
    }
}
