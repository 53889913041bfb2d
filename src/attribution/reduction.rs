// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layer reduction policies and token heatmaps.
//!
//! A [`ReductionPolicy`] collapses a list of per-layer vectors (one value
//! per token position) into a single vector.  The same policies apply to
//! incoming-attention vectors and to attribution traces.

use std::fmt;
use std::str::FromStr;

use super::count_as_f64;
use crate::error::{AttributionError, Result};
use crate::matrix::LayerAttentionMatrix;

/// Default weight given to the first layer by [`ReductionPolicy::WeightedLayers`].
pub const DEFAULT_MIN_WEIGHT: f64 = 0.1;

/// Default weight given to the last layer by [`ReductionPolicy::WeightedLayers`].
pub const DEFAULT_MAX_WEIGHT: f64 = 1.0;

/// How to combine per-layer vectors into one.
///
/// # Example
///
/// ```
/// use attn_attrib::ReductionPolicy;
///
/// let per_layer = vec![vec![1.0, 0.0], vec![0.0, 3.0]];
/// assert_eq!(ReductionPolicy::LastLayer.reduce(&per_layer).unwrap(), vec![0.0, 3.0]);
/// assert_eq!(ReductionPolicy::MaxAcrossLayers.reduce(&per_layer).unwrap(), vec![1.0, 3.0]);
///
/// let policy: ReductionPolicy = "weighted_layers".parse().unwrap();
/// let weighted = policy.reduce(&per_layer).unwrap();
/// assert!((weighted[0] - 0.1).abs() < 1e-12);
/// assert!((weighted[1] - 3.0).abs() < 1e-12);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ReductionPolicy {
    /// Use only the last layer's vector.
    #[default]
    LastLayer,
    /// Element-wise mean over layers.
    MeanAcrossLayers,
    /// Element-wise maximum over layers.
    MaxAcrossLayers,
    /// Sum of layers weighted by linearly spaced weights, so later layers
    /// count more.
    WeightedLayers {
        /// Weight of layer 0.
        min_weight: f64,
        /// Weight of the last layer.
        max_weight: f64,
    },
}

impl ReductionPolicy {
    /// Weighted policy with the default `0.1 ..= 1.0` weight ramp.
    #[must_use]
    pub const fn weighted() -> Self {
        Self::WeightedLayers {
            min_weight: DEFAULT_MIN_WEIGHT,
            max_weight: DEFAULT_MAX_WEIGHT,
        }
    }

    /// Collapse `per_layer` (layer 0 first) into one vector.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::EmptyInput`] if no vectors are given and
    /// [`AttributionError::ShapeMismatch`] if their lengths differ.
    pub fn reduce(&self, per_layer: &[Vec<f64>]) -> Result<Vec<f64>> {
        let len = check_uniform(per_layer)?;

        let reduced = match *self {
            Self::LastLayer => per_layer.last().cloned().unwrap_or_default(),
            Self::MeanAcrossLayers => {
                let n = count_as_f64(per_layer.len());
                let mut sum = vec![0.0; len];
                accumulate(&mut sum, per_layer, |_| 1.0);
                sum.iter().map(|s| s / n).collect()
            }
            Self::MaxAcrossLayers => {
                let mut max = vec![f64::NEG_INFINITY; len];
                for vector in per_layer {
                    for (m, &v) in max.iter_mut().zip(vector) {
                        *m = m.max(v);
                    }
                }
                max
            }
            Self::WeightedLayers {
                min_weight,
                max_weight,
            } => {
                let weights = layer_weights(per_layer.len(), min_weight, max_weight);
                let mut sum = vec![0.0; len];
                accumulate(&mut sum, per_layer, |layer| {
                    weights.get(layer).copied().unwrap_or(0.0)
                });
                sum
            }
        };
        Ok(reduced)
    }
}

impl fmt::Display for ReductionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastLayer => write!(f, "last_layer"),
            Self::MeanAcrossLayers => write!(f, "mean_across_layers"),
            Self::MaxAcrossLayers => write!(f, "max_across_layers"),
            Self::WeightedLayers { .. } => write!(f, "weighted_layers"),
        }
    }
}

/// Parse a policy name.  `"mean_last_layer"` is accepted as an alias of
/// `"last_layer"` (head mean of the last layer).
impl FromStr for ReductionPolicy {
    type Err = AttributionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "last_layer" | "mean_last_layer" => Ok(Self::LastLayer),
            "mean_across_layers" => Ok(Self::MeanAcrossLayers),
            "max_across_layers" => Ok(Self::MaxAcrossLayers),
            "weighted_layers" => Ok(Self::weighted()),
            other => Err(AttributionError::Config(format!(
                "unknown reduction policy: '{other}'"
            ))),
        }
    }
}

/// `n` weights evenly spaced from `min` to `max` inclusive.
///
/// A single layer gets `min`, matching a one-point linear space.
#[must_use]
pub fn layer_weights(n: usize, min: f64, max: f64) -> Vec<f64> {
    if n <= 1 {
        return vec![min; n];
    }
    let step = (max - min) / count_as_f64(n - 1);
    (0..n).map(|i| step.mul_add(count_as_f64(i), min)).collect()
}

/// Total attention each key position receives (column sums).
///
/// # Shapes
///
/// - `matrix`: `[seq_q, seq_k]`
/// - returns: `[seq_k]`
///
/// # Errors
///
/// Returns [`AttributionError::Tensor`] on reduction failure.
pub fn incoming_attention(matrix: &LayerAttentionMatrix) -> Result<Vec<f64>> {
    Ok(matrix.as_tensor().sum(0)?.to_vec1()?)
}

/// Divide by the maximum when it is positive; otherwise return unchanged.
#[must_use]
pub fn normalize_by_max(vector: &[f64]) -> Vec<f64> {
    let max = vector.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max > 0.0 {
        vector.iter().map(|v| v / max).collect()
    } else {
        vector.to_vec()
    }
}

// ---------------------------------------------------------------------------
// Token heatmap
// ---------------------------------------------------------------------------

/// One token's weight in a [`TokenHeatmap`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapEntry {
    /// Position in the sequence.
    pub position: usize,
    /// Token label.
    pub token: String,
    /// Weight in `[0, 1]` after max normalization.
    pub weight: f64,
}

impl HeatmapEntry {
    /// Unique key of the form `token_{position}_{label}`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("token_{}_{}", self.position, self.token)
    }
}

/// Per-token attention weights aggregated across layers.
#[derive(Debug, Clone)]
pub struct TokenHeatmap {
    /// Policy that produced the weights.
    pub policy: ReductionPolicy,
    /// One entry per position, in sequence order.
    pub entries: Vec<HeatmapEntry>,
}

impl TokenHeatmap {
    /// The `k` heaviest entries, ties by position.
    #[must_use]
    pub fn top(&self, k: usize) -> Vec<&HeatmapEntry> {
        let weights: Vec<f64> = self.entries.iter().map(|e| e.weight).collect();
        super::contributors::ranked_positions(&weights, k)
            .into_iter()
            .filter_map(|(position, _)| self.entries.get(position))
            .collect()
    }

    /// Map token weights onto concept names by keyword match.
    ///
    /// A token contributes its weight to every concept that contains it or
    /// that it contains (case-insensitive, SentencePiece `▁` markers
    /// stripped).  Tokens that are empty after stripping match nothing.
    /// The concept weights are then normalized so the heaviest is `1.0`.
    ///
    /// Returns `(concept, weight)` pairs in the order given.
    ///
    /// # Example
    ///
    /// ```
    /// use attn_attrib::{LayerAttentionMatrix, ReductionPolicy, token_heatmap};
    ///
    /// let layer = LayerAttentionMatrix::from_rows(&[
    ///     vec![1.0, 0.0, 0.0],
    ///     vec![0.5, 0.5, 0.0],
    ///     vec![0.0, 0.5, 0.5],
    /// ]).unwrap();
    /// let tokens: Vec<String> = vec!["<s>".into(), "▁Memo".into(), "▁Tree".into()];
    /// let heatmap = token_heatmap(&[layer], &tokens, ReductionPolicy::LastLayer).unwrap();
    ///
    /// let concepts = heatmap.map_to_concepts(&["MemoTree", "Cache"]);
    /// assert_eq!(concepts[0].0, "MemoTree");
    /// assert!((concepts[0].1 - 1.0).abs() < 1e-12);
    /// assert_eq!(concepts[1].1, 0.0);
    /// ```
    #[must_use]
    pub fn map_to_concepts(&self, concepts: &[&str]) -> Vec<(String, f64)> {
        let lowered: Vec<String> = concepts.iter().map(|c| c.to_lowercase()).collect();
        let mut weights = vec![0.0; concepts.len()];

        for entry in &self.entries {
            let token = entry.token.to_lowercase();
            let token = token.trim_matches('▁');
            if token.is_empty() {
                continue;
            }
            for (weight, concept) in weights.iter_mut().zip(&lowered) {
                if concept.contains(token) || token.contains(concept.as_str()) {
                    *weight += entry.weight;
                }
            }
        }

        concepts
            .iter()
            .map(|c| (*c).to_string())
            .zip(normalize_by_max(&weights))
            .collect()
    }
}

/// Build a token heatmap from head-averaged layers.
///
/// Each layer is reduced to its incoming attention, the policy collapses
/// the layers, and the result is normalized so the heaviest token is `1.0`.
///
/// # Errors
///
/// Returns [`AttributionError::EmptyInput`] if `layers` is empty and
/// [`AttributionError::ShapeMismatch`] if the layers or the token count
/// disagree in length.
pub fn token_heatmap(
    layers: &[LayerAttentionMatrix],
    tokens: &[String],
    policy: ReductionPolicy,
) -> Result<TokenHeatmap> {
    let per_layer = layers
        .iter()
        .map(incoming_attention)
        .collect::<Result<Vec<_>>>()?;
    let len = check_uniform(&per_layer)?;
    if tokens.len() != len {
        return Err(AttributionError::ShapeMismatch(format!(
            "{} token labels for a sequence of length {len}",
            tokens.len()
        )));
    }

    let weights = normalize_by_max(&policy.reduce(&per_layer)?);
    let entries = tokens
        .iter()
        .zip(weights)
        .enumerate()
        .map(|(position, (token, weight))| HeatmapEntry {
            position,
            token: token.clone(),
            weight,
        })
        .collect();

    Ok(TokenHeatmap { policy, entries })
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Common length of all vectors.
fn check_uniform(per_layer: &[Vec<f64>]) -> Result<usize> {
    let len = per_layer
        .first()
        .map(Vec::len)
        .ok_or_else(|| AttributionError::EmptyInput("no per-layer vectors to reduce".into()))?;
    if let Some((layer, v)) = per_layer.iter().enumerate().find(|(_, v)| v.len() != len) {
        return Err(AttributionError::ShapeMismatch(format!(
            "layer {layer} vector has {} entries, layer 0 has {len}",
            v.len()
        )));
    }
    Ok(len)
}

/// Add `weight(layer) * vector` for every layer into `sum`.
fn accumulate(sum: &mut [f64], per_layer: &[Vec<f64>], weight: impl Fn(usize) -> f64) {
    for (layer, vector) in per_layer.iter().enumerate() {
        let w = weight(layer);
        for (s, &v) in sum.iter_mut().zip(vector) {
            *s = v.mul_add(w, *s);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
