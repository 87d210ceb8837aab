//! Domain model (ids, items, attempts, policy, records, errors).

pub mod attempt;
pub mod dead_letter;
pub mod errors;
pub mod ids;
pub mod item;
pub mod policy;
pub mod record;

pub use attempt::{AttemptOutcome, DeliveryAttempt};
pub use dead_letter::DeadLetter;
pub use errors::{ErrorKind, HandlerError};
pub use ids::{DeliveryId, MessageId, ParseIdError};
pub use item::{Item, Subject};
pub use policy::{NextAction, PolicyError, RedeliveryPolicy};
pub use record::{RecordKey, StoredRecord};
