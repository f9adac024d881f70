use std::collections::BTreeMap;

use crate::error::SketchError;
use crate::metrics::{
    percentile_label, Aggregate, InterMetric, InterMetricKind, MetricKey,
};

use super::{FlushCtx, HistoParts};

/// Relative error bound of the bucket layout.
pub const DEFAULT_ALPHA: f64 = 0.01;

/// Cap on bucket-map size per sign. Exceeding it collapses the lowest
/// buckets, which keeps merge closed over the cap at the cost of accuracy
/// in the far-left tail.
const MAX_BINS: usize = 4096;

/// Values below this magnitude land in the dedicated zero bucket.
const TINY: f64 = 1e-9;

/// Log-bucketed quantile sketch with bounded relative error.
///
/// A positive value `v` lands in bucket `ceil(ln v / ln γ)` where
/// `γ = (1 + α) / (1 − α)`, so every value in a bucket is within `α` of
/// the bucket midpoint. Negative values mirror into a second bucket map
/// keyed over `|v|`; zero has its own counter. Bucket placement depends
/// only on the value, so the sketch's contents are identical for any
/// ordering of the same input multiset, and buckets live in ordered maps
/// so iteration and the wire form are deterministic too.
///
/// Exact `min`, `max`, `count`, and `sum` ride along for the aggregate
/// records and for clamping quantiles to the observed range.
#[derive(Debug, Clone)]
pub struct HistoSketch {
    pub(crate) alpha: f64,
    gamma_ln: f64,
    pub(crate) bins: BTreeMap<i32, u64>,
    pub(crate) neg_bins: BTreeMap<i32, u64>,
    pub(crate) zero: u64,
    pub(crate) count: u64,
    pub(crate) sum: f64,
    pub(crate) min: f64,
    pub(crate) max: f64,
    /// Digest seed carried through merges and over the wire so peers
    /// aggregating the same input agree on the full serialized form.
    pub(crate) seed: Option<u64>,
}

impl Default for HistoSketch {
    fn default() -> Self {
        Self::with_alpha(DEFAULT_ALPHA)
    }
}

impl HistoSketch {
    #[must_use]
    pub fn with_alpha(alpha: f64) -> Self {
        let gamma = (1.0 + alpha) / (1.0 - alpha);
        Self {
            alpha,
            gamma_ln: gamma.ln(),
            bins: BTreeMap::new(),
            neg_bins: BTreeMap::new(),
            zero: 0,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            seed: None,
        }
    }

    /// Rebuilds a sketch from its wire parts.
    ///
    /// # Errors
    /// Returns [`SketchError::InvalidParameter`] on an out-of-range error
    /// bound or mismatched key/count arrays.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        alpha: f64,
        bins: Vec<(i32, u64)>,
        neg_bins: Vec<(i32, u64)>,
        zero: u64,
        count: u64,
        sum: f64,
        min: f64,
        max: f64,
        seed: Option<u64>,
    ) -> Result<Self, SketchError> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(SketchError::InvalidParameter(
                "histogram error bound out of range",
            ));
        }
        let mut sketch = Self::with_alpha(alpha);
        sketch.bins = bins.into_iter().collect();
        sketch.neg_bins = neg_bins.into_iter().collect();
        sketch.zero = zero;
        sketch.count = count;
        sketch.sum = sum;
        sketch.min = min;
        sketch.max = max;
        sketch.seed = seed;
        Ok(sketch)
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub const fn sum(&self) -> f64 {
        self.sum
    }

    pub fn observe(&mut self, value: f64, rate: f64, digest: u64) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let weight = if rate > 0.0 && rate < 1.0 {
            ((1.0 / rate).round() as u64).max(1)
        } else {
            1
        };
        self.count += weight;
        #[allow(clippy::cast_precision_loss)]
        {
            self.sum += value * weight as f64;
        }
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        self.seed = combine_seeds(self.seed, Some(digest));

        if value.abs() < TINY {
            self.zero += weight;
        } else if value > 0.0 {
            let key = self.key_of(value);
            bucket_add(&mut self.bins, key, weight);
        } else {
            let key = self.key_of(-value);
            bucket_add(&mut self.neg_bins, key, weight);
        }
    }

    /// Adds another sketch's buckets into this one.
    ///
    /// # Errors
    /// Returns [`SketchError::Incompatible`] if the error bounds differ;
    /// bucket keys are only comparable under the same `γ`.
    pub fn merge(&mut self, other: &Self) -> Result<(), SketchError> {
        if self.alpha.to_bits() != other.alpha.to_bits() {
            return Err(SketchError::Incompatible("histogram error bound mismatch"));
        }
        for (&key, &weight) in &other.bins {
            bucket_add(&mut self.bins, key, weight);
        }
        for (&key, &weight) in &other.neg_bins {
            bucket_add(&mut self.neg_bins, key, weight);
        }
        self.zero += other.zero;
        self.count += other.count;
        self.sum += other.sum;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
        self.seed = combine_seeds(self.seed, other.seed);
        Ok(())
    }

    /// The value at quantile `q`, clamped to the observed `[min, max]`.
    ///
    /// The result is the midpoint of the bucket holding rank
    /// `ceil(q · count)`, so it is within the configured relative error of
    /// the true order statistic.
    #[must_use]
    pub fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let rank = ((q * self.count as f64).ceil() as u64).clamp(1, self.count);
        let mut seen = 0u64;
        // Negative buckets first: a larger magnitude key is a smaller value.
        for (&key, &weight) in self.neg_bins.iter().rev() {
            seen += weight;
            if seen >= rank {
                return self.clamp(-self.value_of(key));
            }
        }
        seen += self.zero;
        if self.zero > 0 && seen >= rank {
            return self.clamp(0.0);
        }
        for (&key, &weight) in &self.bins {
            seen += weight;
            if seen >= rank {
                return self.clamp(self.value_of(key));
            }
        }
        self.max
    }

    pub(crate) fn flush(
        &self,
        key: &MetricKey,
        sinks: &[String],
        ctx: &FlushCtx<'_>,
    ) -> Vec<InterMetric> {
        if self.count == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(ctx.percentiles.len() + ctx.aggregates.len());
        for &p in ctx.percentiles {
            out.push(InterMetric {
                name: format!("{}.{}", key.name, percentile_label(p)),
                tags: key.tags.clone(),
                timestamp: ctx.timestamp,
                value: self.quantile(p),
                kind: InterMetricKind::Gauge,
                sinks: sinks.to_vec(),
            });
        }
        if ctx.histo_parts == HistoParts::PercentilesOnly {
            return out;
        }
        for &aggregate in ctx.aggregates {
            #[allow(clippy::cast_precision_loss)]
            let (value, kind) = match aggregate {
                Aggregate::Min => (self.min, InterMetricKind::Gauge),
                Aggregate::Max => (self.max, InterMetricKind::Gauge),
                Aggregate::Count => (self.count as f64, InterMetricKind::Counter),
                Aggregate::Sum => (self.sum, InterMetricKind::Gauge),
                Aggregate::Avg => (self.sum / self.count as f64, InterMetricKind::Gauge),
            };
            out.push(InterMetric {
                name: format!("{}.{}", key.name, aggregate.as_str()),
                tags: key.tags.clone(),
                timestamp: ctx.timestamp,
                value,
                kind,
                sinks: sinks.to_vec(),
            });
        }
        out
    }

    #[allow(clippy::cast_possible_truncation)]
    fn key_of(&self, value: f64) -> i32 {
        (value.ln() / self.gamma_ln).ceil() as i32
    }

    fn value_of(&self, key: i32) -> f64 {
        let gamma = (1.0 + self.alpha) / (1.0 - self.alpha);
        // Midpoint of the bucket interval (γ^(k−1), γ^k].
        2.0 * gamma.powi(key) / (gamma + 1.0)
    }

    fn clamp(&self, value: f64) -> f64 {
        if self.min.is_finite() && self.max.is_finite() {
            value.clamp(self.min, self.max)
        } else {
            value
        }
    }
}

fn bucket_add(map: &mut BTreeMap<i32, u64>, key: i32, weight: u64) {
    *map.entry(key).or_insert(0) += weight;
    if map.len() > MAX_BINS {
        if let Some((_, spilled)) = map.pop_first() {
            if let Some(lowest) = map.values_mut().next() {
                *lowest += spilled;
            }
        }
    }
}

/// Commutative, associative seed combination; `min` so any merge order of
/// the same partials lands on the same seed.
const fn combine_seeds(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if x < y { x } else { y }),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;

    fn ctx<'a>(percentiles: &'a [f64], aggregates: &'a [Aggregate]) -> FlushCtx<'a> {
        FlushCtx {
            timestamp: 1_700_000_000,
            interval_secs: 10.0,
            percentiles,
            aggregates,
            histo_parts: HistoParts::All,
        }
    }

    #[test]
    fn test_quantiles_within_error_bound() {
        let mut h = HistoSketch::default();
        for i in 1..=100 {
            h.observe(f64::from(i), 1.0, 0);
        }
        for (q, expected) in [(0.5, 50.0), (0.75, 75.0), (0.99, 99.0)] {
            let got = h.quantile(q);
            assert!(
                (got - expected).abs() / expected < 0.02,
                "q={q} got={got} expected={expected}"
            );
        }
        assert!((h.quantile(0.0) - 1.0).abs() < 0.05);
        assert!((h.quantile(1.0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exact_aggregates() {
        let mut h = HistoSketch::default();
        for v in [2.0, 8.0, 4.0] {
            h.observe(v, 1.0, 0);
        }
        assert_eq!(h.count(), 3);
        assert!((h.sum() - 14.0).abs() < 1e-9);
        assert!((h.min - 2.0).abs() < f64::EPSILON);
        assert!((h.max - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_single_value_quantiles_clamp_exact() {
        let mut h = HistoSketch::default();
        h.observe(20.0, 1.0, 0);
        for q in [0.5, 0.75, 0.99] {
            assert!((h.quantile(q) - 20.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_order_insensitive_contents() {
        let values: Vec<f64> = (1..=200).map(f64::from).collect();
        let mut forward = HistoSketch::default();
        for &v in &values {
            forward.observe(v, 1.0, 7);
        }
        let mut backward = HistoSketch::default();
        for &v in values.iter().rev() {
            backward.observe(v, 1.0, 7);
        }
        assert_eq!(forward.bins, backward.bins);
        assert_eq!(forward.count, backward.count);
        assert!((forward.quantile(0.9) - backward.quantile(0.9)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_is_commutative_and_bit_identical() {
        let mut a = HistoSketch::default();
        let mut b = HistoSketch::default();
        for i in 1..=50 {
            a.observe(f64::from(i), 1.0, 11);
        }
        for i in 51..=100 {
            b.observe(f64::from(i), 1.0, 3);
        }

        let mut ab = a.clone();
        ab.merge(&b).expect("same alpha");
        let mut ba = b.clone();
        ba.merge(&a).expect("same alpha");
        assert_eq!(ab.bins, ba.bins);
        assert_eq!(ab.seed, ba.seed);
        assert_eq!(ab.count, ba.count);
        assert!((ab.quantile(0.5) - ba.quantile(0.5)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_into_empty_is_identity() {
        let mut a = HistoSketch::default();
        for i in 1..=30 {
            a.observe(f64::from(i), 1.0, 5);
        }
        let mut empty = HistoSketch::default();
        empty.merge(&a).expect("same alpha");
        assert_eq!(empty.bins, a.bins);
        assert_eq!(empty.count, a.count);
        assert_eq!(empty.seed, a.seed);
    }

    #[test]
    fn test_alpha_mismatch_is_incompatible() {
        let mut a = HistoSketch::with_alpha(0.01);
        let b = HistoSketch::with_alpha(0.02);
        assert!(matches!(a.merge(&b), Err(SketchError::Incompatible(_))));
    }

    #[test]
    fn test_negative_and_zero_values() {
        let mut h = HistoSketch::default();
        for v in [-10.0, -5.0, 0.0, 5.0, 10.0] {
            h.observe(v, 1.0, 0);
        }
        assert!((h.quantile(0.0) - -10.0).abs() / 10.0 < 0.02);
        let median = h.quantile(0.5);
        assert!(median.abs() < 0.01, "median {median}");
        assert!((h.quantile(1.0) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sampled_observation_weight() {
        let mut h = HistoSketch::default();
        h.observe(4.0, 0.25, 0);
        assert_eq!(h.count(), 4);
        assert!((h.sum() - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_flush_emits_percentiles_and_aggregates() {
        let mut h = HistoSketch::default();
        h.observe(20.0, 1.0, 0);
        let key = MetricKey::new("lat", MetricKind::Histogram, vec![]);
        let percentiles = [0.5, 0.99];
        let aggregates = [Aggregate::Min, Aggregate::Max, Aggregate::Count];
        let out = h.flush(&key, &[], &ctx(&percentiles, &aggregates));
        let names: Vec<&str> = out.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "lat.50percentile",
                "lat.99percentile",
                "lat.min",
                "lat.max",
                "lat.count"
            ]
        );

        let only = h.flush(
            &key,
            &[],
            &FlushCtx {
                histo_parts: HistoParts::PercentilesOnly,
                ..ctx(&percentiles, &aggregates)
            },
        );
        assert_eq!(only.len(), 2);
    }
}
