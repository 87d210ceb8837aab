//! Sink port - the durable store each item is persisted to.
//!
//! Inserts must be idempotent per `RecordKey`: under at-least-once delivery
//! the same item can reach `insert` more than once, and the second write has
//! to report `AlreadyPresent` instead of failing.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ErrorKind, Item};

/// Result of a successful insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was appended.
    Inserted,

    /// A row with this key already exists; nothing was written.
    AlreadyPresent,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("store unreachable: {0}")]
    Connection(String),

    #[error("write rejected: {0}")]
    Write(String),
}

impl SinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SinkError::Connection(_) => ErrorKind::Connectivity,
            SinkError::Write(_) => ErrorKind::Handler,
        }
    }
}

/// Must be safe to call concurrently for different items.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn insert(&self, item: &Item) -> Result<InsertOutcome, SinkError>;

    /// Liveness check.
    async fn ping(&self) -> Result<(), SinkError>;
}
