//! Impls - in-memory adapters for the ports.
//!
//! Used by tests and the demo binary. Production adapters live in their own
//! crates (`tributary-pg` for the Postgres sink).

pub mod memory_broker;
pub mod memory_sink;

pub use self::memory_broker::InMemoryBroker;
pub use self::memory_sink::InMemorySink;
