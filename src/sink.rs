//! ClickHouse writers
//!
//! A [Sink] inserts a batch of rows into a table in one call, either all rows
//! land or the call fails. [TableProcessor] binds a sink to a table so a
//! worker can flush into it.
pub mod http;
pub mod memory;
pub mod native;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::SinkError;
use crate::worker::{flush::throughput, Processor};

pub use http::HttpSink;
pub use memory::MemorySink;
pub use native::NativeSink;

#[async_trait]
pub trait Sink<E>: Send + Sync {
    async fn write(&self, table: &str, rows: &[E]) -> Result<(), SinkError>;
}

/// Processor inserting every batch into a single table
pub struct TableProcessor<E> {
    sink: Arc<dyn Sink<E>>,
    table: String,
    label: String,
}

impl<E> TableProcessor<E> {
    pub fn new(sink: Arc<dyn Sink<E>>, table: &str, label: &str) -> TableProcessor<E> {
        TableProcessor {
            sink,
            table: table.to_owned(),
            label: label.to_owned(),
        }
    }
}

#[async_trait]
impl<E: Send + Sync> Processor<E> for TableProcessor<E> {
    async fn process(&self, batch: &[E]) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        info!(table = %self.table, count, "Processing {} batch", self.label);

        let started = Instant::now();
        if let Err(e) = self.sink.write(&self.table, batch).await {
            error!(table = %self.table, count, error = %e, "Inserting {} batch failed", self.label);
            return Err(e).with_context(|| format!("inserting {count} rows into {}", self.table));
        }
        let duration = started.elapsed();
        info!(
            table = %self.table,
            count,
            duration_ms = duration.as_millis() as u64,
            throughput = throughput(count, duration),
            "{} batch inserted to ClickHouse",
            self.label
        );
        Ok(())
    }
}
