//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULIDs wrapped in a phantom-typed `Id<T>`, so a `MessageId` can never be
//! passed where a `DeliveryId` is expected.
//!
//! ## ULID properties
//! - **Sortable by time**: the timestamp is the most significant part
//! - **Generated without coordination**: publishers on several nodes never collide
//! - **128-bit**: same width as a UUID

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each ID family.
///
/// Supplies the prefix used by `Display` ("msg-", "dlv-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ID type. `T` only exists at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when a prefixed ID string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id {0:?}")]
pub struct ParseIdError(String);

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// Accepts both the prefixed form produced by `Display` and a bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError(s.to_string()))
    }
}

/// Marker for published messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Marker for a single hand-out of a message to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Delivery {}

impl IdMarker for Delivery {
    fn prefix() -> &'static str {
        "dlv-"
    }
}

/// Identifier of a published message. Doubles as its idempotency key.
pub type MessageId = Id<Message>;

/// Identifier of one delivery of a message (a redelivery gets a new one).
pub type DeliveryId = Id<Delivery>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        let msg = MessageId::from_ulid(Ulid::new());
        let dlv = DeliveryId::from_ulid(Ulid::new());

        assert!(msg.to_string().starts_with("msg-"));
        assert!(dlv.to_string().starts_with("dlv-"));
        // let _: MessageId = dlv; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = MessageId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = MessageId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn display_form_parses_back() {
        let id = MessageId::from_ulid(Ulid::new());
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let bare: MessageId = id.as_ulid().to_string().parse().unwrap();
        assert_eq!(bare, id);
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!("msg-not-a-ulid".parse::<MessageId>().is_err());
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<MessageId>(), size_of::<Ulid>());
        assert_eq!(size_of::<DeliveryId>(), 16);
    }
}
