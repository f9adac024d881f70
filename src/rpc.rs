//! Forward RPC wire types and sketch (de)serialization.
//!
//! The prost messages here are the stable wire form of each sketch family;
//! a partial serialized by one release must decode on any other release of
//! the same major version.

use prost::Message;

use crate::error::{ParseError, PipelineError, SketchError};
use crate::metrics::{MetricKey, MetricKind, Sample, SampleValue, Scope};
use crate::sketch::{CounterSketch, GaugeSketch, HistoSketch, SetSketch, Sketch};
use crate::worker::Entry;

#[allow(clippy::doc_markdown, clippy::default_trait_access)]
pub mod pb {
    tonic::include_proto!("samovar.v1");
}

pub(crate) const fn kind_to_wire(kind: MetricKind) -> pb::MetricKind {
    match kind {
        MetricKind::Counter => pb::MetricKind::Counter,
        MetricKind::Gauge => pb::MetricKind::Gauge,
        MetricKind::Histogram => pb::MetricKind::Histogram,
        MetricKind::Timer => pb::MetricKind::Timer,
        MetricKind::Set => pb::MetricKind::Set,
    }
}

pub(crate) fn kind_from_wire(raw: i32) -> Option<MetricKind> {
    match pb::MetricKind::try_from(raw).ok()? {
        pb::MetricKind::Counter => Some(MetricKind::Counter),
        pb::MetricKind::Gauge => Some(MetricKind::Gauge),
        pb::MetricKind::Histogram => Some(MetricKind::Histogram),
        pb::MetricKind::Timer => Some(MetricKind::Timer),
        pb::MetricKind::Set => Some(MetricKind::Set),
        pb::MetricKind::Unspecified => None,
    }
}

pub(crate) const fn scope_to_wire(scope: Scope) -> pb::Scope {
    match scope {
        Scope::Mixed => pb::Scope::Mixed,
        Scope::LocalOnly => pb::Scope::LocalOnly,
        Scope::GlobalOnly => pb::Scope::GlobalOnly,
    }
}

pub(crate) fn scope_from_wire(raw: i32) -> Scope {
    match pb::Scope::try_from(raw) {
        Ok(pb::Scope::LocalOnly) => Scope::LocalOnly,
        Ok(pb::Scope::GlobalOnly) => Scope::GlobalOnly,
        _ => Scope::Mixed,
    }
}

/// Serializes a sketch into its family's wire message.
#[must_use]
pub fn encode_sketch(sketch: &Sketch) -> Vec<u8> {
    match sketch {
        Sketch::Counter(c) => pb::CounterSketch { sum: c.sum() }.encode_to_vec(),
        Sketch::Gauge(g) => pb::GaugeSketch {
            value: g.value(),
            sequence: g.sequence,
        }
        .encode_to_vec(),
        Sketch::Set(s) => pb::SetSketch {
            precision: u32::from(s.precision()),
            registers: s.registers().to_vec(),
        }
        .encode_to_vec(),
        Sketch::Histogram(h) => {
            let (keys, counts) = h.bins.iter().map(|(&k, &c)| (k, c)).unzip();
            let (negative_keys, negative_counts) =
                h.neg_bins.iter().map(|(&k, &c)| (k, c)).unzip();
            pb::HistogramSketch {
                alpha: h.alpha,
                keys,
                counts,
                negative_keys,
                negative_counts,
                zero_count: h.zero,
                count: h.count,
                sum: h.sum,
                min: h.min,
                max: h.max,
                seed: h.seed.unwrap_or(0),
            }
            .encode_to_vec()
        }
    }
}

/// Decodes a sketch payload for the given family.
///
/// # Errors
/// Returns [`PipelineError::Decode`] on malformed protobuf and
/// [`PipelineError::Sketch`] on shape violations (mismatched arrays,
/// out-of-range parameters).
pub fn decode_sketch(kind: MetricKind, bytes: &[u8]) -> Result<Sketch, PipelineError> {
    match kind {
        MetricKind::Counter => {
            let msg = pb::CounterSketch::decode(bytes)?;
            Ok(Sketch::Counter(CounterSketch { sum: msg.sum }))
        }
        MetricKind::Gauge => {
            let msg = pb::GaugeSketch::decode(bytes)?;
            Ok(Sketch::Gauge(GaugeSketch {
                value: msg.value,
                sequence: msg.sequence,
            }))
        }
        MetricKind::Set => {
            let msg = pb::SetSketch::decode(bytes)?;
            let precision = u8::try_from(msg.precision)
                .map_err(|_| SketchError::InvalidParameter("set precision out of range"))?;
            Ok(Sketch::Set(SetSketch::from_parts(precision, msg.registers)?))
        }
        MetricKind::Histogram | MetricKind::Timer => {
            let msg = pb::HistogramSketch::decode(bytes)?;
            if msg.keys.len() != msg.counts.len()
                || msg.negative_keys.len() != msg.negative_counts.len()
            {
                return Err(SketchError::InvalidParameter(
                    "histogram key/count arrays do not match",
                )
                .into());
            }
            let bins = msg.keys.into_iter().zip(msg.counts).collect();
            let neg_bins = msg.negative_keys.into_iter().zip(msg.negative_counts).collect();
            let seed = if msg.seed == 0 { None } else { Some(msg.seed) };
            Ok(Sketch::Histogram(HistoSketch::from_parts(
                msg.alpha, bins, neg_bins, msg.zero_count, msg.count, msg.sum, msg.min, msg.max,
                seed,
            )?))
        }
    }
}

/// Renders one shard-table slot as a forwardable partial.
#[must_use]
pub fn partial_from_entry(key: &MetricKey, entry: &Entry) -> pb::PartialSketch {
    pb::PartialSketch {
        name: key.name.clone(),
        tags: key.tags.clone(),
        kind: kind_to_wire(key.kind) as i32,
        scope: scope_to_wire(entry.scope) as i32,
        sketch: encode_sketch(&entry.sketch),
        digest: key.digest(),
        sinks: entry.sinks.clone(),
    }
}

/// Rebuilds the shard-table slot a partial was serialized from.
///
/// # Errors
/// Returns [`PipelineError`] on an unknown family or an undecodable
/// sketch payload.
pub fn partial_into_entry(partial: pb::PartialSketch) -> Result<(MetricKey, Entry), PipelineError> {
    let kind = kind_from_wire(partial.kind)
        .ok_or_else(|| PipelineError::Custom("unknown metric kind on wire".to_string()))?;
    let sketch = decode_sketch(kind, &partial.sketch)?;
    let key = MetricKey::new(partial.name, kind, partial.tags);
    let scope = scope_from_wire(partial.scope);
    Ok((
        key,
        Entry {
            sketch,
            scope,
            sinks: partial.sinks,
        },
    ))
}

/// Turns one binary-dialect sample into the in-memory form.
///
/// # Errors
/// Returns [`ParseError`] on an unknown family, empty name, or bad rate;
/// an absent rate (zero on the wire) defaults to 1.
pub fn sample_from_wire(wire: pb::WireSample) -> Result<Sample, ParseError> {
    let kind =
        kind_from_wire(wire.kind).ok_or_else(|| ParseError::UnknownType(wire.kind.to_string()))?;
    if wire.name.is_empty() {
        return Err(ParseError::MissingName);
    }
    let rate = if wire.sample_rate == 0.0 {
        1.0
    } else if wire.sample_rate > 0.0 && wire.sample_rate <= 1.0 {
        wire.sample_rate
    } else {
        return Err(ParseError::InvalidRate(wire.sample_rate.to_string()));
    };
    let value = match kind {
        MetricKind::Set => SampleValue::Str(wire.set_value),
        _ => SampleValue::Float(wire.value),
    };
    let key = MetricKey::new(wire.name, kind, wire.tags);
    let scope = scope_from_wire(wire.scope);
    Ok(Sample::new(key, value, rate, scope).with_sinks(wire.sinks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_survives_the_wire() {
        let mut h = HistoSketch::default();
        for i in 1..=100 {
            h.observe(f64::from(i), 1.0, 42);
        }
        let sketch = Sketch::Histogram(h.clone());
        let bytes = encode_sketch(&sketch);
        let decoded = decode_sketch(MetricKind::Histogram, &bytes).expect("decodes");
        match decoded {
            Sketch::Histogram(back) => {
                assert_eq!(back.count(), h.count());
                assert!((back.quantile(0.5) - h.quantile(0.5)).abs() < f64::EPSILON);
                assert!((back.quantile(0.99) - h.quantile(0.99)).abs() < f64::EPSILON);
            }
            other => panic!("wrong family: {other:?}"),
        }
    }

    #[test]
    fn test_gauge_sequence_survives_the_wire() {
        let mut g = GaugeSketch::default();
        g.observe(1.0);
        g.observe(4.0);
        let bytes = encode_sketch(&Sketch::Gauge(g.clone()));
        match decode_sketch(MetricKind::Gauge, &bytes).expect("decodes") {
            Sketch::Gauge(back) => {
                assert!((back.value() - 4.0).abs() < f64::EPSILON);
                assert_eq!(back.sequence, g.sequence);
            }
            other => panic!("wrong family: {other:?}"),
        }
    }

    #[test]
    fn test_set_survives_the_wire() {
        let mut s = SetSketch::default();
        for i in 0..50 {
            s.observe(&format!("m-{i}"));
        }
        let sketch = Sketch::Set(s.clone());
        let bytes = encode_sketch(&sketch);
        match decode_sketch(MetricKind::Set, &bytes).expect("decodes") {
            Sketch::Set(back) => assert_eq!(back.estimate(), s.estimate()),
            other => panic!("wrong family: {other:?}"),
        }
    }

    #[test]
    fn test_partial_round_trip_preserves_identity() {
        let key = MetricKey::new(
            "api.latency",
            MetricKind::Timer,
            vec!["zone:b".to_string(), "app:web".to_string()],
        );
        let mut sketch = Sketch::new(MetricKind::Timer);
        sketch
            .observe(&SampleValue::Float(20.0), 1.0, key.digest())
            .expect("numeric family");
        let entry = Entry {
            sketch,
            scope: Scope::GlobalOnly,
            sinks: vec!["console".to_string()],
        };
        let partial = partial_from_entry(&key, &entry);
        assert_eq!(partial.digest, key.digest());

        let (back_key, back_entry) = partial_into_entry(partial).expect("decodes");
        assert_eq!(back_key, key);
        assert_eq!(back_entry.scope, Scope::GlobalOnly);
        assert_eq!(back_entry.sinks, vec!["console".to_string()]);
    }

    #[test]
    fn test_truncated_sketch_bytes_are_rejected() {
        let mut s = SetSketch::default();
        s.observe("x");
        let bytes = encode_sketch(&Sketch::Set(s));
        assert!(decode_sketch(MetricKind::Set, &bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_wire_sample_defaults() {
        let wire = pb::WireSample {
            name: "reqs".to_string(),
            tags: vec![],
            kind: pb::MetricKind::Counter as i32,
            value: 2.0,
            set_value: String::new(),
            sample_rate: 0.0,
            scope: pb::Scope::GlobalOnly as i32,
            sinks: vec![],
        };
        let sample = sample_from_wire(wire).expect("valid");
        assert!((sample.rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(sample.scope, Scope::GlobalOnly);
    }
}
