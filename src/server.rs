//! Aggregator server: shard orchestration and the flush protocol.
//!
//! The same server type runs both tiers. A local node partitions each
//! flushed entry by scope and family into local emission and forwarding;
//! a global node emits everything its peers shipped to it. The flush
//! ticker is aligned to wall-clock multiples of the interval so a cluster
//! of nodes closes its intervals together.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, warn};

use crate::config::{Config, Mode};
use crate::forward::{CycleBatches, Forwarder};
use crate::metrics::{Aggregate, InterMetric, MetricKey, MetricKind, Sample, Scope};
use crate::ring::HashRing;
use crate::rpc::pb::forward_server::Forward;
use crate::rpc::pb::{FlushAck, PartialSketch};
use crate::rpc::{partial_from_entry, partial_into_entry};
use crate::sink::{self, Sink};
use crate::sketch::{FlushCtx, HistoParts};
use crate::stats::PipelineStats;
use crate::worker::{Entry, WorkerHandle};

pub struct Server {
    mode: Mode,
    workers: Vec<WorkerHandle>,
    sinks: Vec<Arc<dyn Sink>>,
    ring: Arc<HashRing>,
    forwarder: Option<Forwarder>,
    stats: Arc<PipelineStats>,
    interval: Duration,
    percentiles: Vec<f64>,
    aggregates: Vec<Aggregate>,
}

impl Server {
    /// Builds a server and spawns its worker shards.
    #[must_use]
    pub fn new(
        config: &Config,
        sinks: Vec<Arc<dyn Sink>>,
        ring: Arc<HashRing>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        debug_assert!(
            config.mode != Mode::Proxy,
            "proxy nodes route streams through ProxyRouter; they never own shards"
        );
        let workers = (0..config.num_workers).map(WorkerHandle::spawn).collect();
        let forwarder = match config.mode {
            Mode::Local => Some(Forwarder::new(stats.clone(), config.interval())),
            Mode::Global | Mode::Proxy => None,
        };
        Self {
            mode: config.mode,
            workers,
            sinks,
            ring,
            forwarder,
            stats,
            interval: config.interval(),
            percentiles: config.percentiles.clone(),
            aggregates: config.aggregates.clone(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    fn shard_for(&self, digest: u64) -> &WorkerHandle {
        #[allow(clippy::cast_possible_truncation)]
        let index = (digest % self.workers.len() as u64) as usize;
        &self.workers[index]
    }

    /// Accepts one raw sample off a listener. Never blocks; an over-bound
    /// shard queue drops the sample and counts it.
    pub fn ingest(&self, sample: Sample) {
        self.stats.add_ingested(1);
        let shard = self.shard_for(sample.digest);
        if !shard.try_send_sample(sample) {
            self.stats.add_queue_dropped(1);
        }
    }

    /// Merges an already-aggregated partial into its shard (the global
    /// side of the forward RPC).
    pub fn import(&self, key: MetricKey, entry: Entry) -> bool {
        let shard = self.shard_for(key.digest());
        if shard.try_import(key, entry) {
            self.stats.add_imported(1);
            true
        } else {
            self.stats.add_queue_dropped(1);
            false
        }
    }

    /// Runs one complete flush cycle: swap every shard, partition the
    /// output, emit locally, and ship the forwarded groups.
    pub async fn flush_once(&self) {
        let timestamp = unix_now();
        let replies: Vec<_> = self.workers.iter().map(WorkerHandle::flush).collect();
        let batches = join_all(replies).await;

        let mut emit: Vec<InterMetric> = Vec::new();
        let mut forward = CycleBatches::new();
        for reply in batches {
            match reply {
                Ok(batch) => {
                    for (key, entry) in batch {
                        self.route(key, &entry, timestamp, &mut emit, &mut forward);
                    }
                }
                Err(_) => error!("a worker shard failed to flush; its interval is lost"),
            }
        }

        emit.extend(self.stats.drain(timestamp));
        sink::fan_out(&self.sinks, &emit, &self.stats).await;

        if let Some(forwarder) = &self.forwarder {
            if !forward.is_empty() {
                forwarder.forward_cycle(forward).await;
            }
        }
    }

    /// The scope/family/mode partition deciding local emission vs forwarding.
    fn route(
        &self,
        key: MetricKey,
        entry: &Entry,
        timestamp: i64,
        emit: &mut Vec<InterMetric>,
        forward: &mut CycleBatches,
    ) {
        let ctx = FlushCtx {
            timestamp,
            interval_secs: self.interval.as_secs_f64(),
            percentiles: &self.percentiles,
            aggregates: &self.aggregates,
            histo_parts: HistoParts::All,
        };
        match self.mode {
            // Everything a peer shipped here is emitted. A mixed-scope
            // histogram's aggregates were the local node's business, so
            // only its percentiles are emitted globally.
            Mode::Global => {
                let histo_parts = if key.kind.is_histogram_family() && entry.scope == Scope::Mixed {
                    HistoParts::PercentilesOnly
                } else {
                    HistoParts::All
                };
                emit.extend(entry.sketch.flush(
                    &key,
                    &entry.sinks,
                    &FlushCtx { histo_parts, ..ctx },
                ));
            }
            Mode::Local => match entry.scope {
                Scope::LocalOnly => {
                    emit.extend(entry.sketch.flush(&key, &entry.sinks, &ctx));
                }
                Scope::GlobalOnly => self.queue_forward(key, entry, forward),
                Scope::Mixed => match key.kind {
                    MetricKind::Counter | MetricKind::Gauge => {
                        emit.extend(entry.sketch.flush(&key, &entry.sinks, &ctx));
                    }
                    MetricKind::Set => self.queue_forward(key, entry, forward),
                    MetricKind::Histogram | MetricKind::Timer => {
                        emit.extend(entry.sketch.flush(
                            &key,
                            &entry.sinks,
                            &FlushCtx {
                                histo_parts: HistoParts::PercentilesOnly,
                                ..ctx
                            },
                        ));
                        self.queue_forward(key, entry, forward);
                    }
                },
            },
            // Ruled out at construction.
            Mode::Proxy => unreachable!("proxy nodes do not aggregate"),
        }
    }

    fn queue_forward(&self, key: MetricKey, entry: &Entry, forward: &mut CycleBatches) {
        match self.ring.lookup(&key.name) {
            Some(destination) => forward
                .entry(destination)
                .or_default()
                .push(partial_from_entry(&key, entry)),
            None => {
                self.stats.add_forward_dropped(1);
                warn!("no ring members; dropping partial for {}", key.name);
            }
        }
    }

    /// Graceful shutdown: one final flush, then drain and join the shards
    /// within the deadline. Past the deadline, in-flight data is
    /// abandoned.
    pub async fn shutdown(&self, deadline: Duration) {
        self.flush_once().await;
        for worker in &self.workers {
            worker.close();
        }
        let handles: Vec<_> = self
            .workers
            .iter()
            .filter_map(WorkerHandle::take_join)
            .collect();
        let join = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        });
        if tokio::time::timeout(deadline, join).await.is_err() {
            warn!("shutdown deadline exceeded; abandoning in-flight data");
        }
    }
}

/// Spawns the wall-clock-aligned flush ticker.
#[must_use]
pub fn spawn_flush_loop(server: Arc<Server>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = server.interval();
        tokio::time::sleep(align_delay(interval)).await;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let started = Instant::now();
            server.flush_once().await;
            let elapsed = started.elapsed();
            if elapsed > interval {
                warn!(
                    "flush took {elapsed:?}, over the {interval:?} interval; skipping missed ticks"
                );
            }
        }
    })
}

/// Delay until the next wall-clock multiple of `interval`.
fn align_delay(interval: Duration) -> Duration {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = interval.as_secs().max(1);
    let next = (now.as_secs() / secs + 1) * secs;
    Duration::from_secs(next).saturating_sub(now)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
        })
}

/// The global aggregator's side of the forward RPC: every streamed partial
/// is merged into a shard via [`Server::import`].
pub struct ForwardService {
    server: Arc<Server>,
}

impl ForwardService {
    #[must_use]
    pub const fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

#[tonic::async_trait]
impl Forward for ForwardService {
    async fn forward(
        &self,
        request: Request<Streaming<PartialSketch>>,
    ) -> Result<Response<FlushAck>, Status> {
        let mut inbound = request.into_inner();
        let mut accepted = 0u64;
        while let Some(partial) = inbound.message().await? {
            match partial_into_entry(partial) {
                Ok((key, entry)) => {
                    if self.server.import(key, entry) {
                        accepted += 1;
                    }
                }
                Err(err) => {
                    // The binary-plane analogue of a malformed frame.
                    self.server.stats().add_malformed(1);
                    debug!("dropping undecodable partial: {err}");
                }
            }
        }
        Ok(Response::new(FlushAck { accepted }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricKey, SampleValue};
    use crate::sink::MemorySink;
    use crate::sketch::Sketch;

    fn test_config(mode: &str) -> Config {
        Config::from_json(&format!(
            r#"{{
                "mode": "{mode}",
                "interval_secs": 10,
                "num_workers": 2,
                "grpc_forward_address": "127.0.0.1:1",
                "grpc_address": "127.0.0.1:1"
            }}"#
        ))
        .expect("valid config")
    }

    fn sample(line: &str) -> Sample {
        crate::ingest::parse_line(line).expect("valid line")
    }

    #[tokio::test]
    async fn test_local_flush_partitions_by_scope() {
        let memory = Arc::new(MemorySink::new("memory"));
        let sinks: Vec<Arc<dyn Sink>> = vec![memory.clone()];
        let ring = Arc::new(HashRing::default());
        let server = Server::new(
            &test_config("local"),
            sinks,
            ring,
            Arc::new(PipelineStats::default()),
        );

        server.ingest(sample("local.counter:scope:local|5|c"));
        server.ingest(sample("mixed.counter|100|c"));
        server.ingest(sample("mixed.histo|20|h"));
        server.ingest(sample("global.counter:scope:global|2|c"));
        server.flush_once().await;

        let emitted = memory.drain();
        let names: Vec<&str> = emitted.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"local.counter"));
        assert!(names.contains(&"mixed.counter"));
        // Mixed histograms emit their percentiles locally.
        assert!(names.contains(&"mixed.histo.50percentile"));
        assert!(!names.contains(&"mixed.histo.min"));
        // Global-scope metrics are never emitted locally; with an empty
        // ring the partials (mixed.histo's sketch and global.counter) are
        // dropped, counted, and surfaced through the same cycle's stats.
        assert!(!names.contains(&"global.counter"));
        let dropped = emitted
            .iter()
            .find(|m| m.name == "samovar.forward.dropped")
            .expect("stats emitted");
        assert!((dropped.value - 2.0).abs() < f64::EPSILON);
        server.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_counter_rate_over_the_interval() {
        let memory = Arc::new(MemorySink::new("memory"));
        let sinks: Vec<Arc<dyn Sink>> = vec![memory.clone()];
        let server = Server::new(
            &test_config("local"),
            sinks,
            Arc::new(HashRing::default()),
            Arc::new(PipelineStats::default()),
        );

        for _ in 0..40 {
            server.ingest(sample("reqs:scope:local|5|c|@0.5"));
        }
        server.flush_once().await;

        let emitted = memory.drain();
        let reqs = emitted.iter().find(|m| m.name == "reqs").expect("emitted");
        // 40 samples of 5 at rate 0.5 is a raw sum of 400; over 10s: 40/s.
        assert!((reqs.value - 40.0).abs() < 1e-9);
        server.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_gauge_last_write_wins_per_shard() {
        let memory = Arc::new(MemorySink::new("memory"));
        let sinks: Vec<Arc<dyn Sink>> = vec![memory.clone()];
        let server = Server::new(
            &test_config("local"),
            sinks,
            Arc::new(HashRing::default()),
            Arc::new(PipelineStats::default()),
        );

        for value in [1.0, 9.0, 4.0] {
            server.ingest(sample(&format!("pool.size:scope:local|{value}|g")));
        }
        server.flush_once().await;

        let emitted = memory.drain();
        let gauge = emitted
            .iter()
            .find(|m| m.name == "pool.size")
            .expect("emitted");
        assert!((gauge.value - 4.0).abs() < f64::EPSILON);
        server.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_global_emits_imports_by_scope() {
        let memory = Arc::new(MemorySink::new("memory"));
        let sinks: Vec<Arc<dyn Sink>> = vec![memory.clone()];
        let server = Server::new(
            &test_config("global"),
            sinks,
            Arc::new(HashRing::default()),
            Arc::new(PipelineStats::default()),
        );

        let mixed_key = MetricKey::new("lat.mixed", MetricKind::Histogram, vec![]);
        let mut mixed = Sketch::new(MetricKind::Histogram);
        mixed
            .observe(&SampleValue::Float(20.0), 1.0, mixed_key.digest())
            .expect("numeric");
        assert!(server.import(
            mixed_key,
            Entry {
                sketch: mixed,
                scope: Scope::Mixed,
                sinks: vec![],
            },
        ));

        let global_key = MetricKey::new("lat.global", MetricKind::Histogram, vec![]);
        let mut global = Sketch::new(MetricKind::Histogram);
        global
            .observe(&SampleValue::Float(20.0), 1.0, global_key.digest())
            .expect("numeric");
        assert!(server.import(
            global_key,
            Entry {
                sketch: global,
                scope: Scope::GlobalOnly,
                sinks: vec![],
            },
        ));

        server.flush_once().await;
        let names: Vec<String> = memory.drain().into_iter().map(|m| m.name).collect();
        // Mixed: percentiles only. GlobalOnly: percentiles and aggregates.
        assert!(names.contains(&"lat.mixed.50percentile".to_string()));
        assert!(!names.contains(&"lat.mixed.min".to_string()));
        assert!(names.contains(&"lat.global.50percentile".to_string()));
        assert!(names.contains(&"lat.global.min".to_string()));
        assert!(names.contains(&"lat.global.count".to_string()));
        server.shutdown(Duration::from_secs(5)).await;
    }

    #[test]
    fn test_align_delay_lands_on_a_multiple() {
        let interval = Duration::from_secs(10);
        let delay = align_delay(interval);
        assert!(delay <= interval);
        let target = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            + delay;
        // Within a second of a 10s boundary (the delay itself was computed
        // a moment ago).
        assert!(target.as_secs() % 10 == 0 || (target.as_secs() + 1) % 10 == 0);
    }
}
