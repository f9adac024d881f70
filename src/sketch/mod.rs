//! Mergeable per-family aggregates.
//!
//! Each metric family keeps one compact summary of an interval's
//! observations. All families support `observe`, `merge`, and `flush`;
//! merging is associative and commutative, and merging into a fresh sketch
//! is identity. The set of families is closed, so dispatch is a plain enum
//! match rather than trait objects.

use crate::error::SketchError;
use crate::metrics::{
    Aggregate, InterMetric, MetricKey, MetricKind, SampleValue,
};

mod counter;
mod gauge;
mod histo;
mod set;

pub use counter::CounterSketch;
pub use gauge::GaugeSketch;
pub use histo::{HistoSketch, DEFAULT_ALPHA};
pub use set::{SetSketch, DEFAULT_PRECISION};

/// Which records a histogram flush produces.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum HistoParts {
    /// Percentiles plus the configured aggregates.
    #[default]
    All,
    /// Percentiles only; used where the aggregates are another node's
    /// business (the mixed-scope split).
    PercentilesOnly,
}

/// Everything a flush needs besides the sketch itself.
#[derive(Debug, Copy, Clone)]
pub struct FlushCtx<'a> {
    /// Unix seconds stamped on every emitted record.
    pub timestamp: i64,
    /// Length of the flush interval; counters emit per-second rates.
    pub interval_secs: f64,
    /// Requested quantiles, each in `[0, 1]`.
    pub percentiles: &'a [f64],
    /// Requested histogram aggregates.
    pub aggregates: &'a [Aggregate],
    pub histo_parts: HistoParts,
}

/// One interval's aggregate for a single metric key.
#[derive(Debug, Clone)]
pub enum Sketch {
    Counter(CounterSketch),
    Gauge(GaugeSketch),
    Set(SetSketch),
    Histogram(HistoSketch),
}

impl Sketch {
    /// Fresh empty sketch for a family. Timers share the histogram sketch.
    #[must_use]
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(CounterSketch::default()),
            MetricKind::Gauge => Self::Gauge(GaugeSketch::default()),
            MetricKind::Set => Self::Set(SetSketch::default()),
            MetricKind::Histogram | MetricKind::Timer => Self::Histogram(HistoSketch::default()),
        }
    }

    /// Folds one sample into the sketch.
    ///
    /// # Errors
    /// Returns [`SketchError::InvalidParameter`] if the sample value type
    /// does not match the family (a string for a numeric family or vice
    /// versa); the caller logs and drops, matching the malformed-frame
    /// disposition.
    pub fn observe(
        &mut self,
        value: &SampleValue,
        rate: f64,
        digest: u64,
    ) -> Result<(), SketchError> {
        match (self, value) {
            (Self::Counter(c), SampleValue::Float(v)) => {
                c.observe(*v, rate);
                Ok(())
            }
            (Self::Gauge(g), SampleValue::Float(v)) => {
                g.observe(*v);
                Ok(())
            }
            (Self::Set(s), SampleValue::Str(member)) => {
                s.observe(member);
                Ok(())
            }
            (Self::Histogram(h), SampleValue::Float(v)) => {
                h.observe(*v, rate, digest);
                Ok(())
            }
            _ => Err(SketchError::InvalidParameter(
                "sample value type does not match metric family",
            )),
        }
    }

    /// Merges another sketch of the same family into this one.
    ///
    /// # Errors
    /// Returns [`SketchError::Incompatible`] on a family mismatch or on
    /// mismatched sketch parameters. Either is the fatal bug class: it
    /// cannot arise from well-formed pipeline traffic.
    pub fn merge(&mut self, other: Self) -> Result<(), SketchError> {
        match (self, other) {
            (Self::Counter(a), Self::Counter(b)) => {
                a.merge(&b);
                Ok(())
            }
            (Self::Gauge(a), Self::Gauge(b)) => {
                a.merge(&b);
                Ok(())
            }
            (Self::Set(a), Self::Set(b)) => a.merge(&b),
            (Self::Histogram(a), Self::Histogram(b)) => a.merge(&b),
            _ => Err(SketchError::Incompatible("metric family mismatch")),
        }
    }

    /// Expands the sketch into its flush-time records.
    #[must_use]
    pub fn flush(&self, key: &MetricKey, sinks: &[String], ctx: &FlushCtx<'_>) -> Vec<InterMetric> {
        match self {
            Self::Counter(c) => c.flush(key, sinks, ctx),
            Self::Gauge(g) => g.flush(key, sinks, ctx),
            Self::Set(s) => s.flush(key, sinks, ctx),
            Self::Histogram(h) => h.flush(key, sinks, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;

    #[test]
    fn test_family_mismatch_is_incompatible() {
        let mut counter = Sketch::new(MetricKind::Counter);
        let gauge = Sketch::new(MetricKind::Gauge);
        assert!(matches!(
            counter.merge(gauge),
            Err(SketchError::Incompatible(_))
        ));
    }

    #[test]
    fn test_value_type_mismatch_is_rejected() {
        let mut set = Sketch::new(MetricKind::Set);
        let err = set.observe(&SampleValue::Float(1.0), 1.0, 0);
        assert!(matches!(err, Err(SketchError::InvalidParameter(_))));
    }

    #[test]
    fn test_timer_and_histogram_share_a_sketch() {
        assert!(matches!(
            Sketch::new(MetricKind::Timer),
            Sketch::Histogram(_)
        ));
    }
}
