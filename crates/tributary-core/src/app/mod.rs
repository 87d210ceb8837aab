//! App - the pipeline built on top of the ports.
//!
//! # Components
//! - **Handler / SinkHandler**: per-item processing
//! - **StreamConsumer / ConsumerGroup**: pull, handle, ack/nak/term
//! - **DeadLetterLog**: items that exhausted their deliveries
//! - **StatusMonitor**: periodic backlog status line
//! - **Publisher / PublisherLoop**: putting items on the stream
//! - **PipelineBuilder**: startup checks and wiring

pub mod consumer;
pub mod dead_letter;
pub mod handler;
pub mod monitor;
pub mod pipeline;
pub mod publisher;

pub use self::consumer::{ConsumeStats, ConsumerGroup, ShutdownReport, StreamConsumer};
pub use self::dead_letter::{ACK_WAIT_EXPIRED, DeadLetterLog};
pub use self::handler::{Handler, SinkHandler};
pub use self::monitor::{MonitorHandle, StatusMonitor};
pub use self::pipeline::{Pipeline, PipelineBuilder, RunningPipeline};
pub use self::publisher::{PublishJsonError, Publisher, PublisherLoop, TickPayload};
