// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attribution and attention analysis over head-averaged layer matrices.
//!
//! - [`propagator`]: cross-layer attribution (iterative backward chain and
//!   composite matrix product).
//! - [`contributors`]: top-k `(token, score, position)` ranking.
//! - [`reduction`]: named policies collapsing per-layer vectors into one
//!   token heatmap.
//! - [`stats`]: entropy, first-token share, clean attention and attention
//!   dynamics across generation steps.

pub mod contributors;
pub mod propagator;
pub mod reduction;
pub mod stats;

use std::fmt;

use crate::error::{AttributionError, Result};

/// Position whose attribution is requested.
///
/// `FromEnd(1)` is the last token, matching the `-1` convention used when
/// targets are written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetPosition {
    /// Absolute index into the sequence.
    Index(usize),
    /// Offset counted from the end: `FromEnd(1)` is the last position.
    FromEnd(usize),
}

impl TargetPosition {
    /// The last position in the sequence.
    pub const LAST: Self = Self::FromEnd(1);

    /// Resolve against a sequence of length `seq_len`.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::InvalidPosition`] if the resolved index
    /// falls outside `[0, seq_len)`.
    ///
    /// # Example
    ///
    /// ```
    /// use attn_attrib::TargetPosition;
    ///
    /// assert_eq!(TargetPosition::LAST.resolve(5).unwrap(), 4);
    /// assert_eq!(TargetPosition::Index(2).resolve(5).unwrap(), 2);
    /// assert!(TargetPosition::Index(5).resolve(5).is_err());
    /// ```
    pub fn resolve(self, seq_len: usize) -> Result<usize> {
        let resolved = match self {
            Self::Index(i) if i < seq_len => Some(i),
            Self::FromEnd(k) if k >= 1 && k <= seq_len => Some(seq_len - k),
            _ => None,
        };
        resolved.ok_or(AttributionError::InvalidPosition {
            target: self,
            seq_len,
        })
    }

    /// Convert a signed index (negative counts from the end) to a target.
    #[must_use]
    pub fn from_signed(index: i64) -> Self {
        match usize::try_from(index) {
            Ok(i) => Self::Index(i),
            Err(_) => Self::FromEnd(usize::try_from(index.unsigned_abs()).unwrap_or(usize::MAX)),
        }
    }
}

impl From<usize> for TargetPosition {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl fmt::Display for TargetPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::FromEnd(k) => write!(f, "-{k}"),
        }
    }
}

/// Convert a count to `f64` for averaging and weighting.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub(crate) fn count_as_f64(n: usize) -> f64 {
    // CAST: sequence lengths and layer counts stay far below 2^52
    n as f64
}

/// Sum of absolute values.
#[must_use]
pub fn l1_norm(vector: &[f64]) -> f64 {
    vector.iter().map(|x| x.abs()).sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn resolve_from_end() {
        assert_eq!(TargetPosition::FromEnd(1).resolve(3).unwrap(), 2);
        assert_eq!(TargetPosition::FromEnd(3).resolve(3).unwrap(), 0);
        assert!(TargetPosition::FromEnd(4).resolve(3).is_err());
        assert!(TargetPosition::FromEnd(0).resolve(3).is_err());
    }

    #[test]
    fn resolve_empty_sequence() {
        assert!(TargetPosition::Index(0).resolve(0).is_err());
        assert!(TargetPosition::LAST.resolve(0).is_err());
    }

    #[test]
    fn signed_conversion() {
        assert_eq!(TargetPosition::from_signed(-1), TargetPosition::LAST);
        assert_eq!(TargetPosition::from_signed(-3), TargetPosition::FromEnd(3));
        assert_eq!(TargetPosition::from_signed(4), TargetPosition::Index(4));
    }

    #[test]
    fn display() {
        assert_eq!(TargetPosition::Index(7).to_string(), "7");
        assert_eq!(TargetPosition::LAST.to_string(), "-1");
    }

    #[test]
    fn l1_norm_abs() {
        assert!((l1_norm(&[0.5, -0.25, 0.25]) - 1.0).abs() < 1e-12);
    }
}
