//! Sink contract and the bundled sink implementations.
//!
//! The pipeline treats a sink as opaque: it hands over a batch of flushed
//! records and a cycle-end flush call. Records carrying a non-empty sink
//! filter are only offered to the sinks they name. A failing sink is
//! counted and skipped; it never blocks the others.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::{SinkConfig, SinkKind};
use crate::error::{ConfigError, SinkError};
use crate::metrics::{InterMetric, InterMetricKind};
use crate::stats::PipelineStats;

/// A downstream consumer of flushed records.
#[async_trait]
pub trait Sink: Send + Sync {
    /// The name `sinkonly:` filters match against.
    fn name(&self) -> &str;

    /// Delivers one batch. Implementations should keep going past
    /// individual bad records; the batch is best-effort.
    async fn emit(&self, metrics: &[InterMetric]) -> Result<(), SinkError>;

    /// Marks the end of a flush cycle.
    async fn flush(&self) -> Result<(), SinkError>;
}

/// Builds the configured sinks.
///
/// # Errors
/// Returns [`ConfigError`] for sink kinds that cannot be constructed (none
/// of the bundled kinds can currently fail).
pub fn build_sinks(configs: &[SinkConfig]) -> Result<Vec<Arc<dyn Sink>>, ConfigError> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(configs.len());
    for config in configs {
        let sink: Arc<dyn Sink> = match config.kind {
            SinkKind::Console => Arc::new(ConsoleSink::new(&config.name, &config.prefix)),
            SinkKind::Blackhole => Arc::new(BlackholeSink::new(&config.name)),
            SinkKind::Memory => Arc::new(MemorySink::new(&config.name)),
        };
        sinks.push(sink);
    }
    Ok(sinks)
}

/// Offers a batch to every sink, honoring per-record sink filters. Errors
/// are counted and the remaining sinks still run.
pub async fn fan_out(sinks: &[Arc<dyn Sink>], metrics: &[InterMetric], stats: &PipelineStats) {
    for sink in sinks {
        let selected: Vec<InterMetric> = metrics
            .iter()
            .filter(|m| m.sinks.is_empty() || m.sinks.iter().any(|s| s == sink.name()))
            .cloned()
            .collect();
        if !selected.is_empty() {
            if let Err(err) = sink.emit(&selected).await {
                stats.add_sink_errors(1);
                warn!("sink {} emit failed: {err}", sink.name());
            }
        }
        if let Err(err) = sink.flush().await {
            stats.add_sink_errors(1);
            warn!("sink {} flush failed: {err}", sink.name());
        }
    }
}

/// Writes each record as one line on stdout.
pub struct ConsoleSink {
    name: String,
    prefix: String,
}

impl ConsoleSink {
    #[must_use]
    pub fn new(name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&self, metrics: &[InterMetric]) -> Result<(), SinkError> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for metric in metrics {
            let kind = match metric.kind {
                InterMetricKind::Counter => "counter",
                InterMetricKind::Gauge => "gauge",
            };
            writeln!(
                out,
                "{}{} {} {} {} #{}",
                self.prefix,
                metric.timestamp,
                metric.name,
                metric.value,
                kind,
                metric.tags.join(",")
            )?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        std::io::stdout().flush()?;
        Ok(())
    }
}

/// Accepts and discards everything. Useful for load tests and for keeping
/// a pipeline running while its real sinks are being replaced.
pub struct BlackholeSink {
    name: String,
}

impl BlackholeSink {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Sink for BlackholeSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&self, _metrics: &[InterMetric]) -> Result<(), SinkError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Buffers every record in memory until drained.
pub struct MemorySink {
    name: String,
    records: parking_lot::Mutex<Vec<InterMetric>>,
}

impl MemorySink {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Takes everything buffered so far.
    #[must_use]
    pub fn drain(&self) -> Vec<InterMetric> {
        std::mem::take(&mut self.records.lock())
    }

    /// Copies the buffer without clearing it.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InterMetric> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&self, metrics: &[InterMetric]) -> Result<(), SinkError> {
        self.records.lock().extend_from_slice(metrics);
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
