//! Pipeline-level errors.
//!
//! Port errors (`BrokerError`, `SinkError`) and `HandlerError` live next to
//! the code that produces them; this module holds the errors of the wiring
//! and run-time layers built on top of them.

use thiserror::Error;

use crate::domain::{ErrorKind, PolicyError};
use crate::ports::{BrokerError, SinkError};

/// Why a consume loop stopped before it was asked to.
#[derive(Debug, Clone, Error)]
pub enum ConsumeError {
    #[error("broker failure: {0}")]
    Broker(#[from] BrokerError),

    #[error("consumer worker {0} panicked")]
    WorkerPanicked(usize),
}

impl ConsumeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumeError::Broker(e) => e.kind(),
            ConsumeError::WorkerPanicked(_) => ErrorKind::Handler,
        }
    }
}

/// Rejected pipeline configuration. Reported before anything is started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("workers must be at least 1")]
    NoWorkers,

    #[error("stream name {0:?} is not valid")]
    InvalidStreamName(String),

    #[error("stream {0} has no subjects")]
    NoStreamSubjects(String),

    #[error("subject filter {0:?} is not valid")]
    InvalidSubjectFilter(String),

    #[error("durable consumer name {0:?} is not valid")]
    InvalidDurableName(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("max_ack_pending must be at least 1")]
    ZeroMaxAckPending,

    #[error("handler timeout ({handler_timeout:?}) must be shorter than ack wait ({ack_wait:?})")]
    HandlerTimeoutTooLong {
        handler_timeout: std::time::Duration,
        ack_wait: std::time::Duration,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("sink: {0}")]
    Sink(#[from] SinkError),

    #[error("consumer: {0}")]
    Consume(#[from] ConsumeError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(e) => e.kind(),
            PipelineError::Broker(e) => e.kind(),
            PipelineError::Sink(e) => e.kind(),
            PipelineError::Consume(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_underlying_error() {
        let lost = PipelineError::from(BrokerError::Connection("refused".into()));
        assert_eq!(lost.kind(), ErrorKind::Connectivity);

        let missing = PipelineError::from(ConsumeError::from(BrokerError::StreamNotFound(
            "ENTRIES".into(),
        )));
        assert_eq!(missing.kind(), ErrorKind::Configuration);

        let sink = PipelineError::from(SinkError::Connection("down".into()));
        assert_eq!(sink.kind(), ErrorKind::Connectivity);

        assert_eq!(
            PipelineError::from(ConfigError::NoWorkers).kind(),
            ErrorKind::Configuration
        );
    }
}
