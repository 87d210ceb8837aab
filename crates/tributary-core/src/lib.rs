//! tributary-core
//!
//! At-least-once ingestion: items published to a durable stream are pulled by
//! a consumer, persisted through a sink, and acked. Failed items are
//! redelivered with backoff up to a bound, then dead-lettered.
//!
//! # Modules
//! - **domain**: items, delivery attempts, redelivery policy, dead letters, ids
//! - **ports**: `Broker`, `Sink`, `Clock`, `IdGenerator`
//! - **impls**: in-memory broker and sink
//! - **app**: consumer group, status monitor, publisher, pipeline wiring
//! - **config**: pipeline configuration and validation
//! - **observability**: tracing setup and status snapshots

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

pub use config::{PipelineConfig, StartupPolicy};
pub use error::{ConfigError, ConsumeError, PipelineError};
