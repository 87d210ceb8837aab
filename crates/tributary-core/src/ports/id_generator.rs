//! IdGenerator port - ID generation behind a trait.
//!
//! # Implementations
//! - **UlidGenerator**: ULID with the timestamp taken from a `Clock`

use crate::domain::ids::{DeliveryId, MessageId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_message_id(&self) -> MessageId;

    fn generate_delivery_id(&self) -> DeliveryId;
}

/// ULID-based generator.
///
/// The time part comes from the clock, the rest is random, so a `FixedClock`
/// still yields distinct IDs sharing one timestamp.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_message_id(&self) -> MessageId {
        MessageId::from(self.next_ulid())
    }

    fn generate_delivery_id(&self) -> DeliveryId {
        DeliveryId::from(self.next_ulid())
    }
}
