use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use tributary_core::app::{Handler, PipelineBuilder, Publisher, PublisherLoop, SinkHandler};
use tributary_core::domain::{HandlerError, Item};
use tributary_core::impls::{InMemoryBroker, InMemorySink};
use tributary_core::observability::init_tracing;
use tributary_core::ports::{Sink, SinkError};
use tributary_core::{PipelineConfig, PipelineError};
use tributary_pg::PostgresSink;

const SUBJECT: &str = "entries.new";

#[derive(Debug, Deserialize)]
struct Entry {
    seq: u64,
}

/// Checks the payload is an entry, then persists it.
struct EntryHandler {
    inner: SinkHandler,
}

#[async_trait]
impl Handler for EntryHandler {
    async fn handle(&self, item: &Item) -> Result<(), HandlerError> {
        let entry: Entry = serde_json::from_slice(item.payload())
            .map_err(|e| HandlerError::rejected(format!("json decode: {e}")))?;
        debug!(seq = entry.seq, message_id = %item.id(), "persisting entry");
        self.inner.handle(item).await
    }
}

async fn open_sink() -> Result<Arc<dyn Sink>, PipelineError> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let sink = PostgresSink::connect(&url)
                .await
                .map_err(|e| SinkError::Connection(e.to_string()))?;
            info!(table = sink.table(), "persisting to postgres");
            Ok(Arc::new(sink))
        }
        Err(_) => {
            warn!("DATABASE_URL not set, persisting to memory");
            Ok(Arc::new(InMemorySink::new()))
        }
    }
}

async fn run() -> Result<(), PipelineError> {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = open_sink().await?;

    let config = PipelineConfig::default().with_workers(2);
    let running = PipelineBuilder::new(broker.clone(), Arc::clone(&sink), config)
        .with_handler(Arc::new(EntryHandler {
            inner: SinkHandler::new(sink),
        }))
        .build()
        .await?
        .start();

    let (stop_publisher, publisher_rx) = watch::channel(false);
    let publisher = Arc::new(Publisher::new(broker));
    let publishing =
        PublisherLoop::new(publisher, SUBJECT, Duration::from_secs(1)).spawn(publisher_rx);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "ctrl-c handler failed, shutting down");
            }
            info!("shutdown requested");
        }
        _ = running.stopped() => warn!("pipeline stopped on its own"),
    }

    let _ = stop_publisher.send(true);
    match publishing.await {
        Ok(published) => info!(published, "publisher stopped"),
        Err(e) => warn!(error = %e, "publisher task failed"),
    }

    let dead_letters = Arc::clone(running.dead_letters());
    let report = running.shutdown().await?;
    info!(
        acked = report.stats.acked,
        nacked = report.stats.nacked,
        dead_lettered = dead_letters.count(),
        aborted = report.aborted,
        "pipeline drained"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind().as_str(), error = %e, "tributary failed");
            ExitCode::FAILURE
        }
    }
}
