// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON reports, layer-by-token heatmap grids and step-by-token
//! generation spectrograms.
//!
//! Results are rendered as [`serde_json::Value`] so callers can write them
//! wherever they like; the crate itself performs no file I/O.

use std::fmt;
use std::str::FromStr;

use serde_json::{Value, json};

use crate::attribution::contributors::{Contributor, format_token};
use crate::attribution::propagator::{APPROXIMATION_LABEL, AttributionAnalysis, AttributionResult};
use crate::attribution::reduction::TokenHeatmap;
use crate::attribution::stats::{AttentionEvolution, FirstTokenShare, FirstTokenTrace};
use crate::error::{AttributionError, Result};

// ---------------------------------------------------------------------------
// Heatmap scale
// ---------------------------------------------------------------------------

/// Value scale applied to heatmap cells.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeatmapScale {
    /// Raw attribution values.
    Linear,
    /// `ln(1 + |x|)`, which keeps small contributions visible next to a
    /// dominant first token.
    #[default]
    Log1p,
}

impl HeatmapScale {
    /// Apply the scale to one value.
    #[must_use]
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Self::Linear => value,
            Self::Log1p => value.abs().ln_1p(),
        }
    }
}

impl fmt::Display for HeatmapScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Log1p => write!(f, "log1p"),
        }
    }
}

impl FromStr for HeatmapScale {
    type Err = AttributionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "log1p" => Ok(Self::Log1p),
            other => Err(AttributionError::Config(format!(
                "unknown heatmap scale: '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Heatmap grid
// ---------------------------------------------------------------------------

/// Layer-by-token grid of scaled attribution values.
///
/// Row `i` is the trace vector recorded after layer `i`; column `j` is token
/// position `j`.
///
/// # Example
///
/// ```
/// use attn_attrib::{AttributionPropagator, HeatmapGrid, HeatmapScale, LayerAttentionMatrix, TargetPosition};
///
/// let layer = LayerAttentionMatrix::from_rows(&[
///     vec![1.0, 0.0, 0.0],
///     vec![0.5, 0.5, 0.0],
///     vec![0.2, 0.3, 0.5],
/// ]).unwrap();
/// let tokens: Vec<String> = vec!["<s>".into(), "a".into(), "b".into()];
/// let propagator = AttributionPropagator::new(vec![layer.clone(), layer], tokens.clone()).unwrap();
/// let result = propagator.compute(TargetPosition::LAST).unwrap();
///
/// let grid = HeatmapGrid::from_trace(&result, &tokens, HeatmapScale::Linear, 2);
/// assert_eq!(grid.layers, vec![0, 1]);
/// assert_eq!(grid.tokens.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapGrid {
    /// Layer index of each row.
    pub layers: Vec<usize>,
    /// Column labels (at most `max_tokens`).
    pub tokens: Vec<String>,
    /// `cells[row][col]`, scaled.
    pub cells: Vec<Vec<f64>>,
    /// Scale applied to every cell.
    pub scale: HeatmapScale,
}

impl HeatmapGrid {
    /// Build a grid from a result's layer trace, keeping the first
    /// `max_tokens` positions.
    #[must_use]
    pub fn from_trace(
        result: &AttributionResult,
        tokens: &[String],
        scale: HeatmapScale,
        max_tokens: usize,
    ) -> Self {
        let width = result
            .layer_trace
            .first()
            .map_or(0, |l| l.vector.len())
            .min(max_tokens);
        let cells = result
            .layer_trace
            .iter()
            .map(|l| l.vector.iter().take(width).map(|&v| scale.apply(v)).collect())
            .collect();
        Self {
            layers: result.layer_trace.iter().map(|l| l.layer).collect(),
            tokens: (0..width)
                .map(|i| tokens.get(i).map_or_else(String::new, |t| format_token(t)))
                .collect(),
            cells,
            scale,
        }
    }

    /// Largest cell value, or `None` for an empty grid.
    #[must_use]
    pub fn max_value(&self) -> Option<f64> {
        self.cells
            .iter()
            .flatten()
            .copied()
            .reduce(f64::max)
    }

    /// Render as a JSON object with `layers`, `tokens`, `scale` and `cells`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "layers": self.layers,
            "tokens": self.tokens,
            "scale": self.scale.to_string(),
            "cells": self.cells,
        })
    }
}

// ---------------------------------------------------------------------------
// Generation spectrogram
// ---------------------------------------------------------------------------

/// Step-by-token grid of scaled attention over a generation run.
///
/// Row `i` is generation step `i + 1`; column `j` is context token `j`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramGrid {
    /// 1-based step number of each row.
    pub steps: Vec<usize>,
    /// Context token labels, one per column.
    pub tokens: Vec<String>,
    /// `cells[step][token]`, scaled.
    pub cells: Vec<Vec<f64>>,
    /// Scale applied to every cell.
    pub scale: HeatmapScale,
}

impl SpectrogramGrid {
    /// Build a spectrogram from the rows recorded by `evolution`.
    #[must_use]
    pub fn from_evolution(evolution: &AttentionEvolution, scale: HeatmapScale) -> Self {
        let cells: Vec<Vec<f64>> = evolution
            .steps()
            .iter()
            .map(|row| row.iter().map(|&v| scale.apply(v)).collect())
            .collect();
        Self {
            steps: (1..=cells.len()).collect(),
            tokens: evolution.tokens().to_vec(),
            cells,
            scale,
        }
    }

    /// Largest cell value, or `None` for an empty grid.
    #[must_use]
    pub fn max_value(&self) -> Option<f64> {
        self.cells.iter().flatten().copied().reduce(f64::max)
    }

    /// Render as a JSON object with `steps`, `tokens`, `scale` and `cells`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "steps": self.steps,
            "tokens": self.tokens,
            "scale": self.scale.to_string(),
            "cells": self.cells,
        })
    }
}

// ---------------------------------------------------------------------------
// JSON reports
// ---------------------------------------------------------------------------

/// A contributor as `{"token", "score", "position"}`.
fn contributor_json(c: &Contributor) -> Value {
    json!({
        "token": c.token,
        "score": c.score,
        "position": c.position,
    })
}

/// A contributor list as a JSON array.
fn contributors_json(contributors: &[Contributor]) -> Value {
    Value::Array(contributors.iter().map(contributor_json).collect())
}

impl AttributionResult {
    /// Render the result, including its layer trace, as JSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let trace: Vec<Value> = self
            .layer_trace
            .iter()
            .map(|l| {
                json!({
                    "layer": l.layer,
                    "attribution": l.vector,
                    "top_contributors": contributors_json(&l.top_contributors),
                })
            })
            .collect();
        json!({
            "target_position": self.target_position,
            "target_token": self.target_token,
            "layer_trace": trace,
            "final_attribution": self.final_attribution,
            "final_top_contributors": contributors_json(&self.final_top_contributors),
            "approximation": APPROXIMATION_LABEL,
        })
    }
}

impl AttributionAnalysis {
    /// Render every result plus the shared composite matrix as JSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "tokens": self.tokens,
            "n_layers": self.n_layers,
            "composite_matrix": self.composite_matrix,
            "approximation": APPROXIMATION_LABEL,
            "results": self.results.iter().map(AttributionResult::to_json).collect::<Vec<_>>(),
        })
    }
}

impl TokenHeatmap {
    /// Render as `{"policy", "weights": {"token_{i}_{label}": weight}}`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let weights: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .map(|e| (e.key(), json!(e.weight)))
            .collect();
        json!({
            "policy": self.policy.to_string(),
            "weights": weights,
        })
    }
}

impl AttentionEvolution {
    /// Render the raw recorded rows as `{"tokens", "n_steps", "attention"}`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "tokens": self.tokens(),
            "n_steps": self.n_steps(),
            "attention": self.steps(),
        })
    }
}

/// One field of every share in a step, layer 0 first.
fn share_field(step: &[FirstTokenShare], field: fn(&FirstTokenShare) -> f64) -> Vec<f64> {
    step.iter().map(field).collect()
}

impl FirstTokenTrace {
    /// Render per-step, per-layer first-token attention, totals and ratios,
    /// plus the mean and max last-layer ratio (`null` before any step).
    #[must_use]
    pub fn to_json(&self) -> Value {
        let steps: Vec<Value> = self
            .steps()
            .iter()
            .enumerate()
            .map(|(i, step)| {
                json!({
                    "step": i + 1,
                    "attention": share_field(step, |s| s.attention),
                    "total": share_field(step, |s| s.total),
                    "ratio": share_field(step, |s| s.ratio),
                })
            })
            .collect();
        json!({
            "n_steps": self.n_steps(),
            "steps": steps,
            "avg_ratio_last_layer": self.mean_last_layer_ratio(),
            "max_ratio_last_layer": self.max_last_layer_ratio(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
