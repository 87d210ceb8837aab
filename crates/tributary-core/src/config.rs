//! Pipeline configuration.
//!
//! Plain structs with defaults and `with_*` builders. Nothing here reads files
//! or the environment; `validate` is called by `PipelineBuilder::build` so a
//! bad value stops the pipeline before it touches the broker.

use std::time::Duration;

use crate::domain::{RedeliveryPolicy, Subject};
use crate::error::ConfigError;
use crate::ports::{ConsumerConfig, StreamConfig};

/// What to do with a stream that already exists at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartupPolicy {
    /// Keep the stream and any items still in it.
    #[default]
    Preserve,

    /// Delete and recreate the stream, discarding undelivered items.
    Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub name: String,
    pub subjects: Vec<String>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: "ENTRIES".to_string(),
            subjects: vec!["entries.>".to_string()],
        }
    }
}

impl StreamSettings {
    pub fn to_stream_config(&self) -> StreamConfig {
        StreamConfig::new(self.name.clone(), self.subjects.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
    pub max_ack_pending: usize,

    /// Longest a worker blocks on the broker before checking for shutdown.
    pub fetch_wait: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            durable_name: "ingest".to_string(),
            filter_subject: "entries.>".to_string(),
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 1000,
            fetch_wait: Duration::from_secs(1),
        }
    }
}

impl ConsumerSettings {
    pub fn to_consumer_config(&self, policy: &RedeliveryPolicy) -> ConsumerConfig {
        ConsumerConfig::new(self.durable_name.clone(), self.filter_subject.clone())
            .with_policy(policy)
            .with_ack_wait(self.ack_wait)
            .with_max_ack_pending(self.max_ack_pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub stream: StreamSettings,
    pub consumer: ConsumerSettings,
    pub redelivery: RedeliveryPolicy,
    pub monitor: MonitorSettings,
    pub startup: StartupPolicy,

    /// Concurrent consume loops on the durable consumer.
    pub workers: usize,

    pub handler_timeout: Duration,

    /// How long shutdown waits for in-flight handlers before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream: StreamSettings::default(),
            consumer: ConsumerSettings::default(),
            redelivery: RedeliveryPolicy::default(),
            monitor: MonitorSettings::default(),
            startup: StartupPolicy::default(),
            workers: 1,
            handler_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, name: impl Into<String>, subjects: Vec<String>) -> Self {
        self.stream = StreamSettings {
            name: name.into(),
            subjects,
        };
        self
    }

    pub fn with_consumer(
        mut self,
        durable_name: impl Into<String>,
        filter_subject: impl Into<String>,
    ) -> Self {
        self.consumer.durable_name = durable_name.into();
        self.consumer.filter_subject = filter_subject.into();
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.consumer.ack_wait = ack_wait;
        self
    }

    pub fn with_max_ack_pending(mut self, max_ack_pending: usize) -> Self {
        self.consumer.max_ack_pending = max_ack_pending;
        self
    }

    pub fn with_fetch_wait(mut self, fetch_wait: Duration) -> Self {
        self.consumer.fetch_wait = fetch_wait;
        self
    }

    pub fn with_redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor.interval = interval;
        self
    }

    pub fn without_monitor(mut self) -> Self {
        self.monitor.enabled = false;
        self
    }

    pub fn with_startup(mut self, startup: StartupPolicy) -> Self {
        self.startup = startup;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }

        let stream = &self.stream;
        if !is_valid_name(&stream.name) {
            return Err(ConfigError::InvalidStreamName(stream.name.clone()));
        }
        if stream.subjects.is_empty() {
            return Err(ConfigError::NoStreamSubjects(stream.name.clone()));
        }
        if let Some(bad) = stream
            .subjects
            .iter()
            .find(|s| !Subject::new(s.as_str()).is_valid_filter())
        {
            return Err(ConfigError::InvalidSubjectFilter(bad.clone()));
        }

        let consumer = &self.consumer;
        if !is_valid_name(&consumer.durable_name) {
            return Err(ConfigError::InvalidDurableName(consumer.durable_name.clone()));
        }
        if !Subject::new(consumer.filter_subject.as_str()).is_valid_filter() {
            return Err(ConfigError::InvalidSubjectFilter(
                consumer.filter_subject.clone(),
            ));
        }

        for (name, value) in [
            ("ack_wait", consumer.ack_wait),
            ("fetch_wait", consumer.fetch_wait),
            ("handler_timeout", self.handler_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.monitor.enabled && self.monitor.interval.is_zero() {
            return Err(ConfigError::ZeroDuration("monitor interval"));
        }
        if consumer.max_ack_pending == 0 {
            return Err(ConfigError::ZeroMaxAckPending);
        }

        // Otherwise the broker redelivers items whose handler is still running.
        if self.handler_timeout >= consumer.ack_wait {
            return Err(ConfigError::HandlerTimeoutTooLong {
                handler_timeout: self.handler_timeout,
                ack_wait: consumer.ack_wait,
            });
        }

        // Re-run the policy's own checks: the field is public and may have
        // been built by hand.
        RedeliveryPolicy::new(self.redelivery.max_deliver(), self.redelivery.backoff().to_vec())?;
        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.startup, StartupPolicy::Preserve);
        assert_eq!(config.monitor.interval, Duration::from_secs(30));
        assert_eq!(config.redelivery.max_deliver(), 3);
    }

    #[test]
    fn consumer_config_carries_policy_limits() {
        let config = PipelineConfig::default()
            .with_ack_wait(Duration::from_secs(45))
            .with_max_ack_pending(10);
        let consumer = config.consumer.to_consumer_config(&config.redelivery);

        assert_eq!(consumer.durable_name, "ingest");
        assert_eq!(consumer.max_deliver, 3);
        assert_eq!(
            consumer.backoff,
            vec![Duration::from_secs(60), Duration::from_secs(300)]
        );
        assert_eq!(consumer.ack_wait, Duration::from_secs(45));
        assert_eq!(consumer.max_ack_pending, 10);
    }

    #[rstest]
    #[case(PipelineConfig::default().with_workers(0), ConfigError::NoWorkers)]
    #[case(
        PipelineConfig::default().with_stream("", vec!["entries.>".into()]),
        ConfigError::InvalidStreamName(String::new())
    )]
    #[case(
        PipelineConfig::default().with_stream("ENTRIES", vec![]),
        ConfigError::NoStreamSubjects("ENTRIES".into())
    )]
    #[case(
        PipelineConfig::default().with_consumer("ingest", "entries..new"),
        ConfigError::InvalidSubjectFilter("entries..new".into())
    )]
    #[case(
        PipelineConfig::default().with_consumer("ingest", "entries.>.new"),
        ConfigError::InvalidSubjectFilter("entries.>.new".into())
    )]
    #[case(
        PipelineConfig::default().with_consumer("in gest", "entries.>"),
        ConfigError::InvalidDurableName("in gest".into())
    )]
    #[case(
        PipelineConfig::default().with_fetch_wait(Duration::ZERO),
        ConfigError::ZeroDuration("fetch_wait")
    )]
    #[case(
        PipelineConfig::default().with_monitor_interval(Duration::ZERO),
        ConfigError::ZeroDuration("monitor interval")
    )]
    #[case(
        PipelineConfig::default().with_handler_timeout(Duration::from_secs(30)),
        ConfigError::HandlerTimeoutTooLong {
            handler_timeout: Duration::from_secs(30),
            ack_wait: Duration::from_secs(30),
        }
    )]
    fn invalid_configs_are_rejected(#[case] config: PipelineConfig, #[case] expected: ConfigError) {
        assert_eq!(config.validate(), Err(expected));
    }

    #[test]
    fn wildcard_filters_are_accepted() {
        PipelineConfig::default()
            .with_stream("ENTRIES", vec!["entries.*.eu".into(), "audit.>".into()])
            .with_consumer("ingest", "entries.*.eu")
            .validate()
            .unwrap();
    }

    #[test]
    fn disabled_monitor_ignores_interval() {
        let config = PipelineConfig::default()
            .with_monitor_interval(Duration::ZERO)
            .without_monitor();
        config.validate().unwrap();
    }
}
