//! Error classification and handler errors.

use std::time::Duration;

use thiserror::Error;

/// Operational classification of a failure.
///
/// - Connectivity: broker or database unreachable (fatal at startup and in the consume loop)
/// - Transient: recovered locally, never surfaced (duplicate write, stale ack)
/// - Handler: genuine processing failure, surfaced as a nak
/// - Exhausted: retries used up, surfaced as a dead letter
/// - Configuration: the pipeline is wired against something that does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connectivity,
    Transient,
    Handler,
    Exhausted,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Transient => "transient",
            ErrorKind::Handler => "handler",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Configuration => "configuration",
        }
    }
}

/// Failure reported by a handler for one item.
///
/// Never escapes the consume loop: it is turned into a nak or a dead letter.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("sink write failed: {0}")]
    Sink(#[from] crate::ports::SinkError),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Rejected(String),
}

impl HandlerError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        HandlerError::Rejected(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Sink(e) => e.kind(),
            HandlerError::TimedOut(_)
            | HandlerError::Panicked(_)
            | HandlerError::Rejected(_) => ErrorKind::Handler,
        }
    }
}
