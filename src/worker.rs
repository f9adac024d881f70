//! Worker shards: each owns a disjoint slice of the metric key-space.
//!
//! A shard is one OS thread and one unbounded command channel. Samples,
//! imported partials, and flush requests all travel the same channel, so
//! they are applied strictly in enqueue order; a flush swap is therefore a
//! precise interval boundary without ever pausing ingest.

use std::mem;
use std::thread::{Builder, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::metrics::{MetricKey, Sample, Scope};
use crate::sketch::Sketch;

/// Inbound queue bound per shard. The channel itself is unbounded so that
/// flush commands can never be rejected; the sample path enforces this
/// depth by checking the channel length before sending.
pub const QUEUE_DEPTH: usize = 32_768;

/// One shard-table slot: the sketch plus the routing attributes of the
/// samples that built it.
#[derive(Debug, Clone)]
pub struct Entry {
    pub sketch: Sketch,
    pub scope: Scope,
    /// Sink names the flushed records are restricted to; empty means all.
    pub sinks: Vec<String>,
}

/// One flushed shard table.
pub type FlushBatch = HashMap<MetricKey, Entry>;

enum Command {
    Sample(Box<Sample>),
    Import(MetricKey, Entry),
    Flush(oneshot::Sender<FlushBatch>),
    Shutdown,
}

/// Handle to a running shard; the shard thread exits when it receives
/// [`WorkerHandle::close`]'s shutdown command or the channel disconnects.
pub struct WorkerHandle {
    tx: Sender<Command>,
    join: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Spawns a shard thread.
    #[must_use]
    pub fn spawn(index: usize) -> Self {
        let (tx, rx) = unbounded();
        let join = Builder::new()
            .name(format!("samovar-worker-{index}"))
            .spawn(move || Worker::new(rx).run())
            .ok();
        if join.is_none() {
            error!("failed to spawn worker thread {index}");
        }
        Self {
            tx,
            join: parking_lot::Mutex::new(join),
        }
    }

    /// Enqueues a sample. Returns `false` when the shard queue is over its
    /// depth bound (the sample is dropped, never blocked on).
    pub fn try_send_sample(&self, sample: Sample) -> bool {
        if self.tx.len() >= QUEUE_DEPTH {
            return false;
        }
        self.tx.send(Command::Sample(Box::new(sample))).is_ok()
    }

    /// Enqueues an already-aggregated partial for merge. Same depth bound
    /// as samples.
    pub fn try_import(&self, key: MetricKey, entry: Entry) -> bool {
        if self.tx.len() >= QUEUE_DEPTH {
            return false;
        }
        self.tx.send(Command::Import(key, entry)).is_ok()
    }

    /// Requests a table swap. The returned receiver yields the table as it
    /// stood when the command reached the shard; everything enqueued after
    /// this call lands in the fresh table.
    pub fn flush(&self) -> oneshot::Receiver<FlushBatch> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(reply)).is_err() {
            warn!("flush request sent to a stopped worker");
        }
        rx
    }

    /// Asks the shard thread to exit after draining its queue.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    /// Takes the join handle; used once during shutdown.
    pub fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().take()
    }
}

struct Worker {
    rx: Receiver<Command>,
    table: FlushBatch,
}

impl Worker {
    fn new(rx: Receiver<Command>) -> Self {
        Self {
            rx,
            table: FlushBatch::default(),
        }
    }

    fn run(mut self) {
        while let Ok(command) = self.rx.recv() {
            match command {
                Command::Sample(sample) => self.apply_sample(*sample),
                Command::Import(key, entry) => self.apply_import(key, entry),
                Command::Flush(reply) => {
                    let batch = mem::take(&mut self.table);
                    let _ = reply.send(batch);
                }
                Command::Shutdown => break,
            }
        }
    }

    fn apply_sample(&mut self, sample: Sample) {
        let Sample {
            key,
            value,
            rate,
            digest,
            scope,
            sinks,
        } = sample;
        let entry = self
            .table
            .entry(key)
            .or_insert_with_key(|k| Entry {
                sketch: Sketch::new(k.kind),
                scope,
                sinks: Vec::new(),
            });
        entry.scope = scope;
        if !sinks.is_empty() {
            entry.sinks = sinks;
        }
        if let Err(err) = entry.sketch.observe(&value, rate, digest) {
            error!("failed to record sample: {err}");
        }
    }

    fn apply_import(&mut self, key: MetricKey, incoming: Entry) {
        match self.table.entry(key) {
            hashbrown::hash_map::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.scope = incoming.scope;
                if !incoming.sinks.is_empty() {
                    entry.sinks = incoming.sinks;
                }
                if let Err(err) = entry.sketch.merge(incoming.sketch) {
                    // Same-family merges are always compatible; reaching this
                    // means a corrupted partial got past wire validation.
                    unreachable!("sketch merge mismatch: {err}");
                }
            }
            hashbrown::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(incoming);
            }
        }
    }
}
