// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention distribution statistics.
//!
//! Tools for studying the first-token ("attention sink") anomaly: how much
//! of each query's attention lands on position 0, how concentrated or
//! spread out each row is, what the attention looks like once position 0
//! is removed, and how per-token attention evolves across generation steps.

use super::contributors::ranked_positions;
use super::{TargetPosition, count_as_f64};
use crate::error::{AttributionError, Result};
use crate::matrix::LayerAttentionMatrix;
use crate::report::{HeatmapScale, SpectrogramGrid};

/// Added inside the logarithm so zero weights contribute zero entropy.
pub const ENTROPY_EPS: f64 = 1e-10;

// ---------------------------------------------------------------------------
// Entropy and per-position statistics
// ---------------------------------------------------------------------------

/// Shannon entropy (nats) of `row` after renormalizing it to sum to 1.
///
/// Returns `None` when the row has no positive mass.
///
/// # Example
///
/// ```
/// use attn_attrib::attribution::stats::row_entropy;
///
/// let uniform = row_entropy(&[0.25, 0.25, 0.25, 0.25]).unwrap();
/// assert!((uniform - 4.0_f64.ln()).abs() < 1e-6);
/// assert!(row_entropy(&[1.0, 0.0]).unwrap() < 1e-6);
/// ```
#[must_use]
pub fn row_entropy(row: &[f64]) -> Option<f64> {
    let total: f64 = row.iter().sum();
    if total <= 0.0 {
        return None;
    }
    Some(
        -row.iter()
            .map(|w| {
                let p = w / total;
                p * (p + ENTROPY_EPS).ln()
            })
            .sum::<f64>(),
    )
}

/// Statistics of one query position's causal attention prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionStats {
    /// Query position.
    pub position: usize,
    /// Entropy of the renormalized prefix `row[..=position]`.
    pub entropy: f64,
    /// Weight placed on position 0.
    pub first_token_strength: f64,
    /// Largest single weight in the prefix.
    pub concentration: f64,
}

/// Per-position statistics for one layer.
#[derive(Debug, Clone)]
pub struct LayerDistributionStats {
    /// Layer index.
    pub layer: usize,
    /// One entry per query position with non-zero prefix mass.
    pub positions: Vec<PositionStats>,
}

impl LayerDistributionStats {
    /// Mean entropy across the recorded positions (`0.0` if none).
    #[must_use]
    pub fn mean_entropy(&self) -> f64 {
        mean(self.positions.iter().map(|p| p.entropy))
    }

    /// Mean first-token strength across the recorded positions.
    #[must_use]
    pub fn mean_first_token_strength(&self) -> f64 {
        mean(self.positions.iter().map(|p| p.first_token_strength))
    }
}

/// Entropy, first-token strength and concentration for every layer and
/// query position.
///
/// Only the causal prefix `row[..=q]` of each row is considered.  Positions
/// whose prefix carries no mass are skipped.
///
/// # Errors
///
/// Returns [`AttributionError::Tensor`] on extraction failure.
pub fn distribution_stats(layers: &[LayerAttentionMatrix]) -> Result<Vec<LayerDistributionStats>> {
    layers
        .iter()
        .enumerate()
        .map(|(layer, matrix)| {
            let rows = matrix.to_rows()?;
            let positions = rows
                .iter()
                .enumerate()
                .filter_map(|(q, row)| prefix_stats(q, row))
                .collect();
            Ok(LayerDistributionStats { layer, positions })
        })
        .collect()
}

/// Statistics of `row[..=q]`, or `None` for an all-zero prefix.
fn prefix_stats(q: usize, row: &[f64]) -> Option<PositionStats> {
    let prefix = row.get(..=q).unwrap_or(row);
    let entropy = row_entropy(prefix)?;
    Some(PositionStats {
        position: q,
        entropy,
        first_token_strength: prefix.first().copied().unwrap_or(0.0),
        concentration: prefix.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

// ---------------------------------------------------------------------------
// First-token share
// ---------------------------------------------------------------------------

/// How much of a row's attention mass sits on position 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FirstTokenShare {
    /// Weight on position 0.
    pub attention: f64,
    /// Total weight of the row.
    pub total: f64,
    /// `attention / total`, or `0.0` when the total is zero.
    pub ratio: f64,
}

/// First-token share of one attention row.
#[must_use]
pub fn first_token_share(row: &[f64]) -> FirstTokenShare {
    let attention = row.first().copied().unwrap_or(0.0);
    let total: f64 = row.iter().sum();
    let ratio = if total > 0.0 { attention / total } else { 0.0 };
    FirstTokenShare {
        attention,
        total,
        ratio,
    }
}

/// First-token share of query row `query` in every layer.
///
/// # Errors
///
/// Returns [`AttributionError::InvalidPosition`] if `query` is out of range
/// for any layer.
pub fn first_token_share_by_layer(
    layers: &[LayerAttentionMatrix],
    query: usize,
) -> Result<Vec<FirstTokenShare>> {
    layers
        .iter()
        .map(|m| Ok(first_token_share(&m.row(query)?)))
        .collect()
}

// ---------------------------------------------------------------------------
// Clean attention
// ---------------------------------------------------------------------------

/// Attention with position 0 removed and the rest renormalized.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanAttention {
    /// Weights for positions `offset..`, summing to 1 when renormalized.
    pub weights: Vec<f64>,
    /// Position of `weights[0]` in the original row (1, or 0 if nothing
    /// was removed).
    pub offset: usize,
}

impl CleanAttention {
    /// The `k` heaviest `(position, weight)` pairs, with positions in the
    /// original row's coordinates.
    #[must_use]
    pub fn top(&self, k: usize) -> Vec<(usize, f64)> {
        ranked_positions(&self.weights, k)
            .into_iter()
            .map(|(i, w)| (i + self.offset, w))
            .collect()
    }
}

/// Drop position 0 and renormalize the remaining weights.
///
/// Rows of length 0 or 1 are returned unchanged (offset 0).  A tail with no
/// mass is returned without renormalization.
///
/// # Example
///
/// ```
/// use attn_attrib::attribution::stats::exclude_first_token;
///
/// let clean = exclude_first_token(&[0.8, 0.1, 0.1]);
/// assert_eq!(clean.offset, 1);
/// assert!((clean.weights[0] - 0.5).abs() < 1e-12);
/// ```
#[must_use]
pub fn exclude_first_token(row: &[f64]) -> CleanAttention {
    let Some((_, tail)) = row.split_first().filter(|(_, tail)| !tail.is_empty()) else {
        return CleanAttention {
            weights: row.to_vec(),
            offset: 0,
        };
    };
    let total: f64 = tail.iter().sum();
    let weights = if total > 0.0 {
        tail.iter().map(|w| w / total).collect()
    } else {
        tail.to_vec()
    };
    CleanAttention { weights, offset: 1 }
}

// ---------------------------------------------------------------------------
// Attention dynamics across generation steps
// ---------------------------------------------------------------------------

/// Summary of one context token's attention across generation steps.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenDynamics {
    /// Context position.
    pub position: usize,
    /// Token label.
    pub token: String,
    /// Largest attention over all steps.
    pub max: f64,
    /// Smallest attention over all steps.
    pub min: f64,
    /// Population variance over steps.
    pub variance: f64,
    /// Attention at the last step.
    pub final_value: f64,
}

/// Attention from each newly generated token back to a fixed context.
///
/// Each step records one row (typically the last query row of a chosen
/// layer, head-averaged); only the first `tokens.len()` entries of the row
/// are kept, so rows that also cover generated tokens are accepted.
///
/// # Example
///
/// ```
/// use attn_attrib::AttentionEvolution;
///
/// let mut evo = AttentionEvolution::new(vec!["<s>".into(), "cat".into()]);
/// evo.push_step(&[0.9, 0.1]).unwrap();
/// evo.push_step(&[0.5, 0.3, 0.2]).unwrap();
/// let dynamics = evo.token_dynamics().unwrap();
/// assert!((dynamics[1].max - 0.3).abs() < 1e-12);
/// ```
#[derive(Debug, Clone)]
pub struct AttentionEvolution {
    /// Context token labels.
    tokens: Vec<String>,
    /// One context-length row per generation step.
    steps: Vec<Vec<f64>>,
}

impl AttentionEvolution {
    /// Start tracking attention over `tokens`.
    #[must_use]
    pub const fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            steps: Vec::new(),
        }
    }

    /// Record one generation step.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::ShapeMismatch`] if `row` is shorter than
    /// the context.
    pub fn push_step(&mut self, row: &[f64]) -> Result<()> {
        let context = row.get(..self.tokens.len()).ok_or_else(|| {
            AttributionError::ShapeMismatch(format!(
                "attention row has {} entries, context has {} tokens",
                row.len(),
                self.tokens.len()
            ))
        })?;
        self.steps.push(context.to_vec());
        Ok(())
    }

    /// Number of recorded steps.
    #[must_use]
    pub fn n_steps(&self) -> usize {
        self.steps.len()
    }

    /// Context token labels.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Recorded rows, one per step.
    #[must_use]
    pub fn steps(&self) -> &[Vec<f64>] {
        &self.steps
    }

    /// Step-by-token spectrogram of the recorded rows.
    ///
    /// # Example
    ///
    /// ```
    /// use attn_attrib::{AttentionEvolution, HeatmapScale};
    ///
    /// let mut evo = AttentionEvolution::new(vec!["<s>".into(), "cat".into()]);
    /// evo.push_step(&[0.9, 0.1]).unwrap();
    /// let grid = evo.to_grid(HeatmapScale::Log1p);
    /// assert_eq!(grid.steps, vec![1]);
    /// assert!((grid.cells[0][0] - 1.9_f64.ln()).abs() < 1e-12);
    /// ```
    #[must_use]
    pub fn to_grid(&self, scale: HeatmapScale) -> SpectrogramGrid {
        SpectrogramGrid::from_evolution(self, scale)
    }

    /// Per-token max, min, variance and final value.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::EmptyInput`] if no step was recorded.
    pub fn token_dynamics(&self) -> Result<Vec<TokenDynamics>> {
        if self.steps.is_empty() {
            return Err(AttributionError::EmptyInput(
                "no generation steps recorded".into(),
            ));
        }
        Ok(self
            .tokens
            .iter()
            .enumerate()
            .map(|(position, token)| {
                let series: Vec<f64> = self
                    .steps
                    .iter()
                    .filter_map(|s| s.get(position).copied())
                    .collect();
                let avg = mean(series.iter().copied());
                let variance = mean(series.iter().map(|v| (v - avg) * (v - avg)));
                TokenDynamics {
                    position,
                    token: token.clone(),
                    max: series.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    min: series.iter().copied().fold(f64::INFINITY, f64::min),
                    variance,
                    final_value: series.last().copied().unwrap_or(0.0),
                }
            })
            .collect())
    }

    /// The `k` tokens whose attention varies most across steps.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::EmptyInput`] if no step was recorded.
    pub fn most_dynamic(&self, k: usize) -> Result<Vec<TokenDynamics>> {
        self.top_by(k, |d| d.variance)
    }

    /// The `k` tokens with the highest peak attention.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::EmptyInput`] if no step was recorded.
    pub fn most_attended(&self, k: usize) -> Result<Vec<TokenDynamics>> {
        self.top_by(k, |d| d.max)
    }

    /// Rank dynamics by `key`, descending, ties by position.
    fn top_by(&self, k: usize, key: impl Fn(&TokenDynamics) -> f64) -> Result<Vec<TokenDynamics>> {
        let dynamics = self.token_dynamics()?;
        let scores: Vec<f64> = dynamics.iter().map(&key).collect();
        Ok(ranked_positions(&scores, k)
            .into_iter()
            .filter_map(|(i, _)| dynamics.get(i).cloned())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// First-token share across generation steps
// ---------------------------------------------------------------------------

/// First-token share of every layer, recorded once per generation step.
///
/// Each step holds one [`FirstTokenShare`] per layer, layer 0 first,
/// measured on the last (newest) query row.
///
/// # Example
///
/// ```
/// use attn_attrib::{FirstTokenTrace, LayerAttentionMatrix};
///
/// let layer = LayerAttentionMatrix::from_rows(&[
///     vec![1.0, 0.0],
///     vec![0.8, 0.2],
/// ]).unwrap();
/// let mut trace = FirstTokenTrace::new();
/// trace.record(&[layer]).unwrap();
/// assert!((trace.mean_last_layer_ratio().unwrap() - 0.8).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FirstTokenTrace {
    /// One entry per step, each with one share per layer.
    steps: Vec<Vec<FirstTokenShare>>,
}

impl FirstTokenTrace {
    /// Start an empty trace.
    #[must_use]
    pub const fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Record the last query row of every layer of one forward pass.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::EmptyInput`] if `layers` is empty,
    /// [`AttributionError::InvalidPosition`] for a zero-length layer and
    /// [`AttributionError::ShapeMismatch`] if the layer count differs from
    /// earlier steps.
    pub fn record(&mut self, layers: &[LayerAttentionMatrix]) -> Result<()> {
        let shares = layers
            .iter()
            .map(|m| {
                let last = TargetPosition::LAST.resolve(m.seq_len())?;
                Ok(first_token_share(&m.row(last)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.push(shares)
    }

    /// Record precomputed per-layer shares for one step.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::EmptyInput`] if `shares` is empty and
    /// [`AttributionError::ShapeMismatch`] if the layer count differs from
    /// earlier steps.
    pub fn push(&mut self, shares: Vec<FirstTokenShare>) -> Result<()> {
        if shares.is_empty() {
            return Err(AttributionError::EmptyInput(
                "no layers in first-token step".into(),
            ));
        }
        if let Some(expected) = self.steps.first().map(Vec::len) {
            if expected != shares.len() {
                return Err(AttributionError::ShapeMismatch(format!(
                    "step has {} layers, earlier steps have {expected}",
                    shares.len()
                )));
            }
        }
        self.steps.push(shares);
        Ok(())
    }

    /// Number of recorded steps.
    #[must_use]
    pub fn n_steps(&self) -> usize {
        self.steps.len()
    }

    /// Recorded shares, one `Vec` (layer 0 first) per step.
    #[must_use]
    pub fn steps(&self) -> &[Vec<FirstTokenShare>] {
        &self.steps
    }

    /// Last-layer first-token ratio of every step.
    #[must_use]
    pub fn last_layer_ratios(&self) -> Vec<f64> {
        self.steps
            .iter()
            .filter_map(|step| step.last().map(|s| s.ratio))
            .collect()
    }

    /// Mean last-layer ratio across steps, `None` before any step.
    #[must_use]
    pub fn mean_last_layer_ratio(&self) -> Option<f64> {
        let ratios = self.last_layer_ratios();
        (!ratios.is_empty()).then(|| mean(ratios.into_iter()))
    }

    /// Largest last-layer ratio across steps, `None` before any step.
    #[must_use]
    pub fn max_last_layer_ratio(&self) -> Option<f64> {
        self.last_layer_ratios().into_iter().reduce(f64::max)
    }
}

/// Arithmetic mean, `0.0` for an empty iterator.
fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0_usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / count_as_f64(n) }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
