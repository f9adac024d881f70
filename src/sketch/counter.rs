use crate::metrics::{InterMetric, InterMetricKind, MetricKey};

use super::FlushCtx;

/// Rate-corrected floating accumulator.
///
/// A sample observed with client-side rate `r` stands for `1/r` real
/// events, so it contributes `value / r` to the sum. Flushing emits the
/// per-second rate over the interval.
#[derive(Debug, Clone, Default)]
pub struct CounterSketch {
    pub(crate) sum: f64,
}

impl CounterSketch {
    pub fn observe(&mut self, value: f64, rate: f64) {
        self.sum += value / rate;
    }

    pub fn merge(&mut self, other: &Self) {
        self.sum += other.sum;
    }

    #[must_use]
    pub const fn sum(&self) -> f64 {
        self.sum
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
            value: self.sum / ctx.interval_secs,
            kind: InterMetricKind::Counter,
            sinks: sinks.to_vec(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Aggregate, MetricKind};
    use crate::sketch::HistoParts;

    fn ctx(interval_secs: f64) -> FlushCtx<'static> {
        const PCTS: &[f64] = &[];
        const AGGS: &[Aggregate] = &[];
        FlushCtx {
            timestamp: 1_700_000_000,
            interval_secs,
            percentiles: PCTS,
            aggregates: AGGS,
            histo_parts: HistoParts::All,
        }
    }

    #[test]
    fn test_rate_correction() {
        let mut c = CounterSketch::default();
        for _ in 0..25 {
            c.observe(2.0, 0.5);
        }
        // 25 samples of value 2 at rate 0.5 stand for a raw sum of 100.
        assert!((c.sum() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_flush_emits_per_second_rate() {
        let mut c = CounterSketch::default();
        c.observe(30.0, 1.0);
        let key = MetricKey::new("reqs", MetricKind::Counter, vec![]);
        let out = c.flush(&key, &[], &ctx(10.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "reqs");
        assert!((out[0].value - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut a = CounterSketch::default();
        a.observe(1.0, 1.0);
        let mut b = CounterSketch::default();
        b.observe(2.0, 0.5);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b;
        ba.merge(&a);
        assert!((ab.sum() - ba.sum()).abs() < 1e-12);
    }
}
