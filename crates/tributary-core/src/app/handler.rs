//! Handler - what the consumer runs for each delivered item.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{HandlerError, Item};
use crate::ports::{InsertOutcome, Sink};

/// Processes one item.
///
/// `Ok` acks the delivery, `Err` hands the item to the redelivery policy.
/// Handlers see every item at least once and possibly more often, so they
/// must tolerate repeats.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, item: &Item) -> Result<(), HandlerError>;
}

/// Persists each item through a `Sink`.
///
/// A duplicate insert counts as success: the record from an earlier delivery
/// is already there.
pub struct SinkHandler {
    sink: Arc<dyn Sink>,
}

impl SinkHandler {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Handler for SinkHandler {
    async fn handle(&self, item: &Item) -> Result<(), HandlerError> {
        match self.sink.insert(item).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::AlreadyPresent => {
                debug!(message_id = %item.id(), "item already persisted, treating as success");
            }
        }
        Ok(())
    }
}
