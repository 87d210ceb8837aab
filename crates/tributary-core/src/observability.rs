//! Tracing setup and the status snapshot the monitor reports.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Initialize tracing for the process.
///
/// The filter comes from `RUST_LOG`, falling back to `info`. Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// One sample of the consumer's backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub stream: String,
    pub consumer: String,

    /// Waiting for a first delivery or a scheduled redelivery.
    pub pending: u64,

    /// Delivered and not yet settled.
    pub in_flight: u64,

    pub redeliveries: u64,
    pub acked: u64,
    pub dead_lettered: u64,

    pub sampled_at: DateTime<Utc>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} pending={} in_flight={} redeliveries={} acked={} dead_lettered={} at={}",
            self.stream,
            self.consumer,
            self.pending,
            self.in_flight,
            self.redeliveries,
            self.acked,
            self.dead_lettered,
            self.sampled_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_line_carries_every_count() {
        let snapshot = StatusSnapshot {
            stream: "ENTRIES".into(),
            consumer: "ingest".into(),
            pending: 4,
            in_flight: 2,
            redeliveries: 1,
            acked: 10,
            dead_lettered: 0,
            sampled_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };
        assert_eq!(
            snapshot.to_string(),
            "ENTRIES/ingest pending=4 in_flight=2 redeliveries=1 acked=10 dead_lettered=0 at=2024-05-01T12:00:00Z"
        );
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
