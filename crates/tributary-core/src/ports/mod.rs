//! Ports - the seams to external systems.
//!
//! Each trait stands for a collaborator the pipeline does not own: the broker
//! holding the stream, the store receiving records, and the clock. Concrete
//! adapters live in `impls` (in-memory) and in separate crates (Postgres).

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod sink;

pub use self::broker::{
    Broker, BrokerError, ConsumerConfig, ConsumerInfo, Delivery, ExhaustedItem, PublishAck,
    StreamConfig, StreamInfo,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::sink::{InsertOutcome, Sink, SinkError};
