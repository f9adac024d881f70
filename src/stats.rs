//! Internal drop and error counters, re-emitted through the pipeline.
//!
//! Nothing on the data path recovers by retry, so every disposition in the
//! error table must at least be visible. Each flush cycle drains these into
//! ordinary counter records carried by the same sinks as user metrics.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::{InterMetric, InterMetricKind};

/// Shared counters; increments are relaxed, drains swap to zero.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Samples accepted off a listener.
    pub ingested: AtomicU64,
    /// Frames that failed to parse.
    pub malformed: AtomicU64,
    /// Frames with a type field outside the known families.
    pub unknown_kind: AtomicU64,
    /// Samples dropped because a shard queue was over its bound.
    pub queue_dropped: AtomicU64,
    /// Partials accepted over the forward RPC.
    pub imported: AtomicU64,
    /// Sink emit/flush failures.
    pub sink_errors: AtomicU64,
    /// Partials dropped because a forward cycle failed or had no owner.
    pub forward_dropped: AtomicU64,
    /// Messages the proxy could not hand to a downstream.
    pub proxy_dropped: AtomicU64,
}

impl PipelineStats {
    pub fn add_ingested(&self, n: u64) {
        self.ingested.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_malformed(&self, n: u64) {
        self.malformed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_unknown_kind(&self, n: u64) {
        self.unknown_kind.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_queue_dropped(&self, n: u64) {
        self.queue_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_imported(&self, n: u64) {
        self.imported.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_sink_errors(&self, n: u64) {
        self.sink_errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_forward_dropped(&self, n: u64) {
        self.forward_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_proxy_dropped(&self, n: u64) {
        self.proxy_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Swaps every counter to zero and renders the prior values as flush
    /// records for the cycle that just closed.
    #[must_use]
    pub fn drain(&self, timestamp: i64) -> Vec<InterMetric> {
        let counters = [
            ("samovar.ingest.received", &self.ingested),
            ("samovar.ingest.malformed", &self.malformed),
            ("samovar.ingest.unknown_type", &self.unknown_kind),
            ("samovar.worker.queue_dropped", &self.queue_dropped),
            ("samovar.import.received", &self.imported),
            ("samovar.sink.errors", &self.sink_errors),
            ("samovar.forward.dropped", &self.forward_dropped),
            ("samovar.proxy.dropped", &self.proxy_dropped),
        ];
        counters
            .iter()
            .map(|(name, counter)| InterMetric {
                name: (*name).to_string(),
                tags: Vec::new(),
                timestamp,
                #[allow(clippy::cast_precision_loss)]
                value: counter.swap(0, Ordering::Relaxed) as f64,
                kind: InterMetricKind::Counter,
                sinks: Vec::new(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_resets_counters() {
        let stats = PipelineStats::default();
        stats.add_ingested(5);
        stats.add_malformed(2);

        let drained = stats.drain(0);
        let ingested = drained
            .iter()
            .find(|m| m.name == "samovar.ingest.received")
            .expect("present");
        assert!((ingested.value - 5.0).abs() < f64::EPSILON);
        let malformed = drained
            .iter()
            .find(|m| m.name == "samovar.ingest.malformed")
            .expect("present");
        assert!((malformed.value - 2.0).abs() < f64::EPSILON);

        // Second drain sees zeros.
        let again = stats.drain(0);
        assert!(again.iter().all(|m| m.value.abs() < f64::EPSILON));
    }
}
