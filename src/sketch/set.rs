use crate::error::SketchError;
use crate::metrics::{stable_hash64, InterMetric, InterMetricKind, MetricKey};

use super::FlushCtx;

/// Register index width in bits. 2^12 one-byte registers give a relative
/// error around 1.6% at negligible memory per tracked set.
pub const DEFAULT_PRECISION: u8 = 12;

/// Hash seed for set members. A crate-wide constant: every host must place
/// the same member in the same register for cross-cluster merges to be
/// meaningful.
const MEMBER_SEED: u64 = 0x7361_6d6f_7661_7253;

/// HyperLogLog cardinality sketch.
///
/// The low `precision` bits of a member's hash select a register; the
/// register keeps the maximum rank (leading-zero count plus one) seen in
/// the remaining bits. Merging is element-wise max, so it is associative,
/// commutative, and idempotent.
#[derive(Debug, Clone)]
pub struct SetSketch {
    pub(crate) precision: u8,
    pub(crate) registers: Vec<u8>,
}

impl Default for SetSketch {
    fn default() -> Self {
        Self::with_precision(DEFAULT_PRECISION)
    }
}

impl SetSketch {
    #[must_use]
    pub fn with_precision(precision: u8) -> Self {
        Self {
            precision,
            registers: vec![0; 1 << precision],
        }
    }

    /// Rebuilds a sketch from its wire parts.
    ///
    /// # Errors
    /// Returns [`SketchError::InvalidParameter`] if the register array does
    /// not match the precision.
    pub fn from_parts(precision: u8, registers: Vec<u8>) -> Result<Self, SketchError> {
        if precision == 0 || precision > 16 {
            return Err(SketchError::InvalidParameter(
                "set precision out of range",
            ));
        }
        if registers.len() != 1 << precision {
            return Err(SketchError::InvalidParameter(
                "set register array does not match precision",
            ));
        }
        Ok(Self {
            precision,
            registers,
        })
    }

    #[must_use]
    pub const fn precision(&self) -> u8 {
        self.precision
    }

    #[must_use]
    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    pub fn observe(&mut self, member: &str) {
        let hash = stable_hash64(member, MEMBER_SEED);
        let index = (hash & ((1 << self.precision) - 1)) as usize;
        let suffix = hash >> self.precision;
        // The suffix has `precision` high zero bits by construction, so its
        // leading-zero count is at least `precision`.
        #[allow(clippy::cast_possible_truncation)]
        let rank = if suffix == 0 {
            64 - self.precision + 1
        } else {
            suffix.leading_zeros() as u8 - self.precision + 1
        };
        if self.registers[index] < rank {
            self.registers[index] = rank;
        }
    }

    /// Element-wise max of the register arrays.
    ///
    /// # Errors
    /// Returns [`SketchError::Incompatible`] if the precisions differ.
    pub fn merge(&mut self, other: &Self) -> Result<(), SketchError> {
        if self.precision != other.precision {
            return Err(SketchError::Incompatible("set precision mismatch"));
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *mine < *theirs {
                *mine = *theirs;
            }
        }
        Ok(())
    }

    /// Bias-corrected cardinality estimate with the small-range linear
    /// counting correction.
    #[must_use]
    pub fn estimate(&self) -> u64 {
        #[allow(clippy::cast_precision_loss)]
        let m = self.registers.len() as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let mut harmonic = 0.0;
        let mut zeros = 0u64;
        for &register in &self.registers {
            harmonic += f64::exp2(-f64::from(register));
            if register == 0 {
                zeros += 1;
            }
        }
        let raw = alpha * m * m / harmonic;
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            estimate.round().max(0.0) as u64
        }
    }

    pub(crate) fn flush(
        &self,
        key: &MetricKey,
        sinks: &[String],
        ctx: &FlushCtx<'_>,
    ) -> Vec<InterMetric> {
        #[allow(clippy::cast_precision_loss)]
        vec![InterMetric {
            name: key.name.clone(),
            tags: key.tags.clone(),
            timestamp: ctx.timestamp,
            value: self.estimate() as f64,
            kind: InterMetricKind::Gauge,
            sinks: sinks.to_vec(),
        }]
    }
}
