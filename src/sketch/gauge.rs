use crate::metrics::{InterMetric, InterMetricKind, MetricKey};

use super::FlushCtx;

/// Last-writer-wins scalar.
///
/// Within one shard "last" is observation order. Across hosts there is no
/// usable order, so each sketch carries an observation sequence and merge
/// keeps the operand with the higher `(sequence, value bit pattern)`. The
/// winner under that total order is the same whichever side the merge
/// starts from, which keeps merging commutative and associative; the bit
/// pattern fallback is an arbitrary but stable tie-break.
#[derive(Debug, Clone, Default)]
pub struct GaugeSketch {
    pub(crate) value: f64,
    /// Observations folded into this sketch; zero means empty.
    pub(crate) sequence: u64,
}

impl GaugeSketch {
    pub fn observe(&mut self, value: f64) {
        self.value = value;
        self.sequence += 1;
    }

    pub fn merge(&mut self, other: &Self) {
        if (other.sequence, other.value.to_bits()) > (self.sequence, self.value.to_bits()) {
            self.value = other.value;
            self.sequence = other.sequence;
        }
    }

    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    pub(crate) fn flush(
        &self,
        key: &MetricKey,
        sinks: &[String],
        ctx: &FlushCtx<'_>,
    ) -> Vec<InterMetric> {
        vec![InterMetric {
            name: key.name.clone(),
            tags: key.tags.clone(),
            timestamp: ctx.timestamp,
            value: self.value,
            kind: InterMetricKind::Gauge,
            sinks: sinks.to_vec(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_writer_wins() {
        let mut g = GaugeSketch::default();
        g.observe(1.0);
        g.observe(7.5);
        g.observe(3.0);
        assert!((g.value() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut a = GaugeSketch::default();
        a.observe(1.0);
        a.observe(2.0);
        let mut b = GaugeSketch::default();
        b.observe(5.0);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        // a saw more observations, so it wins from either side.
        assert!((ab.value() - 2.0).abs() < f64::EPSILON);
        assert!((ab.value() - ba.value()).abs() < f64::EPSILON);
        assert_eq!(ab.sequence, ba.sequence);
    }

    #[test]
    fn test_merge_tie_breaks_deterministically() {
        let mut a = GaugeSketch::default();
        a.observe(3.0);
        let mut b = GaugeSketch::default();
        b.observe(7.0);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b;
        ba.merge(&a);
        assert!((ab.value() - ba.value()).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_into_empty_is_identity() {
        let mut a = GaugeSketch::default();
        a.observe(4.0);
        let mut empty = GaugeSketch::default();
        empty.merge(&a);
        assert!((empty.value() - 4.0).abs() < f64::EPSILON);
        assert_eq!(empty.sequence, a.sequence);
    }
}
