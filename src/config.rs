// SPDX-License-Identifier: MIT OR Apache-2.0

//! Analysis configuration parsed from JSON.
//!
//! [`AttributionConfig`] gathers the knobs of an attribution run: which
//! position to explain, how many contributors to report, how per-layer
//! vectors are collapsed, and how heatmaps are scaled.  Every field has a
//! default, so an empty object is a valid configuration.
//!
//! # Usage
//!
//! ```
//! use attn_attrib::{AttributionConfig, ReductionPolicy, TargetPosition};
//!
//! let json = serde_json::json!({
//!     "target_position": -2,
//!     "top_k": 3,
//!     "reduction": "max_across_layers"
//! });
//! let config = AttributionConfig::from_json(&json).unwrap();
//! assert_eq!(config.target, TargetPosition::FromEnd(2));
//! assert_eq!(config.top_k, 3);
//! assert_eq!(config.reduction, ReductionPolicy::MaxAcrossLayers);
//! ```

use serde_json::Value;

use crate::attribution::TargetPosition;
use crate::attribution::propagator::{DEFAULT_LAYER_TOP_K, DEFAULT_TOP_K};
use crate::attribution::reduction::{DEFAULT_MAX_WEIGHT, DEFAULT_MIN_WEIGHT, ReductionPolicy};
use crate::error::{AttributionError, Result};
use crate::report::HeatmapScale;

/// Default number of token columns in a heatmap grid.
pub const DEFAULT_HEATMAP_MAX_TOKENS: usize = 20;

/// Settings for one attribution run.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionConfig {
    /// Position to explain (`FromEnd(1)` = last token).
    pub target: TargetPosition,
    /// Contributors reported for the final attribution.
    pub top_k: usize,
    /// Contributors reported at each layer of the trace.
    pub layer_top_k: usize,
    /// How per-layer vectors are collapsed into one heatmap.
    pub reduction: ReductionPolicy,
    /// Value scale for heatmap grids.
    pub heatmap_scale: HeatmapScale,
    /// Maximum number of token columns in a heatmap grid.
    pub heatmap_max_tokens: usize,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            target: TargetPosition::LAST,
            top_k: DEFAULT_TOP_K,
            layer_top_k: DEFAULT_LAYER_TOP_K,
            reduction: ReductionPolicy::default(),
            heatmap_scale: HeatmapScale::default(),
            heatmap_max_tokens: DEFAULT_HEATMAP_MAX_TOKENS,
        }
    }
}

impl AttributionConfig {
    /// Parse a configuration object, filling absent fields with defaults.
    ///
    /// Recognized fields: `target_position` (negative counts from the end),
    /// `top_k`, `layer_top_k`, `reduction`, `weight_min`, `weight_max`,
    /// `heatmap_scale`, `heatmap_max_tokens`.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::Config`] if the value is not an object,
    /// a policy or scale name is unknown, a count (`top_k`, `layer_top_k`,
    /// `heatmap_max_tokens`) is zero, or the layer weights are not finite.
    pub fn from_json(config: &Value) -> Result<Self> {
        if !config.is_object() {
            return Err(AttributionError::Config(
                "configuration must be a JSON object".into(),
            ));
        }

        let target = config
            .get("target_position")
            .and_then(Value::as_i64)
            .map_or(TargetPosition::LAST, TargetPosition::from_signed);

        let reduction = match get_str(config, "reduction") {
            Some(name) => parse_reduction(config, name)?,
            None => ReductionPolicy::default(),
        };

        let heatmap_scale = match get_str(config, "heatmap_scale") {
            Some(name) => name.parse()?,
            None => HeatmapScale::default(),
        };

        let parsed = Self {
            target,
            top_k: get_usize_or(config, "top_k", DEFAULT_TOP_K),
            layer_top_k: get_usize_or(config, "layer_top_k", DEFAULT_LAYER_TOP_K),
            reduction,
            heatmap_scale,
            heatmap_max_tokens: get_usize_or(
                config,
                "heatmap_max_tokens",
                DEFAULT_HEATMAP_MAX_TOKENS,
            ),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::Config`] if `top_k`, `layer_top_k` or
    /// `heatmap_max_tokens` is zero.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("top_k", self.top_k),
            ("layer_top_k", self.layer_top_k),
            ("heatmap_max_tokens", self.heatmap_max_tokens),
        ] {
            if value == 0 {
                return Err(AttributionError::Config(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

/// Resolve a policy name, applying `weight_min` / `weight_max` to the
/// weighted policy.
fn parse_reduction(config: &Value, name: &str) -> Result<ReductionPolicy> {
    let policy: ReductionPolicy = name.parse()?;
    if let ReductionPolicy::WeightedLayers { .. } = policy {
        let min_weight = get_f64_or(config, "weight_min", DEFAULT_MIN_WEIGHT);
        let max_weight = get_f64_or(config, "weight_max", DEFAULT_MAX_WEIGHT);
        if !min_weight.is_finite() || !max_weight.is_finite() {
            return Err(AttributionError::Config(
                "weight_min and weight_max must be finite".into(),
            ));
        }
        return Ok(ReductionPolicy::WeightedLayers {
            min_weight,
            max_weight,
        });
    }
    Ok(policy)
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract an optional string field.
fn get_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
