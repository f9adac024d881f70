//! Core data model: metric identities, samples, and flush-time records.
//!
//! A [`MetricKey`] is the identity tuple `(name, kind, tag-set)`. Tags are
//! `k:v` strings sorted into a canonical rendering at construction time;
//! equality and hashing are defined over that rendering, so two keys built
//! from the same tags in any order compare equal and land on the same shard.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::Deserialize;

/// Seed for the canonical key digest.
const KEY_SEED: u64 = 0x7361_6d6f_7661_7201;

/// The five metric families the pipeline aggregates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Rate-corrected floating accumulator.
    Counter,
    /// Last-writer-wins scalar.
    Gauge,
    /// Quantile sketch over observed values.
    Histogram,
    /// Same sketch as `Histogram`; kept distinct so `x|h` and `x|ms`
    /// aggregate separately.
    Timer,
    /// Approximate distinct-count over string members.
    Set,
}

impl MetricKind {
    /// Maps a line-dialect type field to a family.
    #[must_use]
    pub fn from_statsd(s: &str) -> Option<Self> {
        match s {
            "c" => Some(Self::Counter),
            "g" => Some(Self::Gauge),
            "h" => Some(Self::Histogram),
            "ms" => Some(Self::Timer),
            "s" => Some(Self::Set),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Timer => "timer",
            Self::Set => "set",
        }
    }

    /// Whether this family is backed by the quantile sketch.
    #[must_use]
    pub const fn is_histogram_family(self) -> bool {
        matches!(self, Self::Histogram | Self::Timer)
    }
}

/// Aggregation scope attached to each sample.
///
/// Governs whether a metric is emitted by the node that ingested it,
/// shipped to the globally-elected aggregator for its name, or both.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    /// Split per family: counters and gauges emit locally, sets forward,
    /// histograms emit percentiles locally and forward the sketch.
    #[default]
    Mixed,
    /// Aggregated and emitted entirely on the ingesting node.
    LocalOnly,
    /// Never emitted locally; the sketch is forwarded whole.
    GlobalOnly,
}

/// Identity of one logical metric: name, family, and canonical tag-set.
///
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub struct MetricKey {
    pub name: String,
    pub kind: MetricKind,
    /// Sorted tags, each `k:v`.
    pub tags: Vec<String>,
    /// The sorted tags joined with `,`; the canonical rendering equality
    /// and hashing are defined over.
    pub joined_tags: String,
}

impl MetricKey {
    /// Builds a key, sorting `tags` into canonical order.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: MetricKind, mut tags: Vec<String>) -> Self {
        tags.sort_unstable();
        let joined_tags = tags.join(",");
        Self {
            name: name.into(),
            kind,
            tags,
            joined_tags,
        }
    }

    /// Stable 64-bit hash of the canonical rendering.
    ///
    /// Used for shard selection and carried on the wire as the sample
    /// digest, so it must not depend on process-local hasher state.
    #[must_use]
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        KEY_SEED.hash(&mut hasher);
        self.name.hash(&mut hasher);
        self.kind.as_str().hash(&mut hasher);
        self.joined_tags.hash(&mut hasher);
        hasher.finish()
    }
}

impl PartialEq for MetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.joined_tags == other.joined_tags
    }
}

impl Eq for MetricKey {}

impl Hash for MetricKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.kind.as_str().hash(state);
        self.joined_tags.hash(state);
    }
}

/// Computes a deterministic 64-bit hash of an item under a fixed seed.
///
/// Shared by the set sketch and the hash ring so that sketches merge
/// consistently across hosts and every router pins a name to the same
/// upstream.
pub(crate) fn stable_hash64<T: Hash + ?Sized>(item: &T, seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    item.hash(&mut hasher);
    hasher.finish()
}

/// The observed value of one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    /// Counter, gauge, histogram, and timer samples.
    Float(f64),
    /// Set members.
    Str(String),
}

/// One ingested observation, pre-aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub key: MetricKey,
    pub value: SampleValue,
    /// Client-side sample rate in `(0, 1]`; counters and histograms scale
    /// by its inverse.
    pub rate: f64,
    /// Stable hash of the canonical key; picks the shard and seeds the
    /// histogram sketch.
    pub digest: u64,
    pub scope: Scope,
    /// Sink names this metric is restricted to; empty means all.
    pub sinks: Vec<String>,
}

impl Sample {
    /// Builds a sample, deriving the digest from the key.
    #[must_use]
    pub fn new(key: MetricKey, value: SampleValue, rate: f64, scope: Scope) -> Self {
        let digest = key.digest();
        Self {
            key,
            value,
            rate,
            digest,
            scope,
            sinks: Vec::new(),
        }
    }

    /// Replaces the derived digest with one computed elsewhere (e.g. by a
    /// remote parser whose frame carried it).
    #[must_use]
    pub const fn with_digest(mut self, digest: u64) -> Self {
        self.digest = digest;
        self
    }

    /// Restricts the flushed records to the named sinks.
    #[must_use]
    pub fn with_sinks(mut self, sinks: Vec<String>) -> Self {
        self.sinks = sinks;
        self
    }
}

/// Downstream kind of a flushed record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterMetricKind {
    Counter,
    Gauge,
}

/// The flush-time output record: one emitted aggregate value.
///
/// One logical metric may expand into many of these (a histogram with
/// three requested percentiles plus `max`/`min`/`count` emits six).
#[derive(Debug, Clone, PartialEq)]
pub struct InterMetric {
    pub name: String,
    pub tags: Vec<String>,
    /// Unix seconds at flush time.
    pub timestamp: i64,
    pub value: f64,
    pub kind: InterMetricKind,
    /// Sink names this record is restricted to; empty means all.
    pub sinks: Vec<String>,
}

/// Aggregates a histogram flush may emit alongside its percentiles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Min,
    Max,
    Count,
    Sum,
    Avg,
}

impl Aggregate {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
        }
    }
}

/// Renders the suffix for a percentile record: `0.5` becomes
/// `50percentile`, `0.999` becomes `99.9percentile`.
#[must_use]
pub fn percentile_label(p: f64) -> String {
    let scaled = (p * 1000.0).round() / 10.0;
    format!("{scaled}percentile")
}
