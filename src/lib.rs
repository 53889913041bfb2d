// SPDX-License-Identifier: MIT OR Apache-2.0

//! # attn-attrib
//!
//! Cross-layer attention attribution for transformer language models, built
//! on [candle](https://github.com/huggingface/candle).
//!
//! Given one head-averaged attention matrix per layer and the token labels
//! of a sequence, attn-attrib answers "which input tokens ultimately feed
//! the representation at position `t`?" by chaining attention backward
//! through every layer.
//!
//! ## Two propagation methods
//!
//! - **Iterative**: start from a one-hot vector at the target and multiply
//!   by each layer's matrix from the last layer to the first, recording the
//!   attribution after every step.
//! - **Composite**: multiply all layers into one matrix
//!   `A_0 · A_1 · … · A_{L-1}` and read its target row.
//!
//! Both are a linear approximation of information flow: residual
//! connections, MLPs and value mixing are ignored.
//!
//! ## Quick start
//!
//! ```
//! use attn_attrib::{AttributionPropagator, LayerAttentionMatrix, TargetPosition};
//!
//! let layer = LayerAttentionMatrix::from_rows(&[
//!     vec![1.0, 0.0, 0.0],
//!     vec![0.5, 0.5, 0.0],
//!     vec![0.2, 0.3, 0.5],
//! ]).unwrap();
//! let tokens: Vec<String> = vec!["<s>".into(), "The".into(), "cat".into()];
//! let propagator = AttributionPropagator::new(vec![layer.clone(), layer], tokens).unwrap();
//!
//! let result = propagator.compute(TargetPosition::LAST).unwrap();
//! assert_eq!(result.layer_trace.len(), 2);
//! assert_eq!(result.final_top_contributors[0].token, "<s>");
//! ```
//!
//! ## Beyond attribution
//!
//! - [`AttentionCache`] collects raw `[batch, heads, seq, seq]` patterns
//!   and converts them to [`LayerAttentionMatrix`] values.
//! - [`ReductionPolicy`] collapses per-layer vectors into one heatmap.
//! - [`attribution::stats`] measures the first-token anomaly: entropy,
//!   first-token share, clean attention and generation dynamics.
//! - [`report`] renders results as JSON, layer-by-token heatmap grids and
//!   step-by-token generation spectrograms.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod attribution;
pub mod cache;
pub mod config;
pub mod error;
pub mod matrix;
pub mod report;
pub mod util;

// --- Attribution --------------------------------------------------------
pub use attribution::TargetPosition;
pub use attribution::contributors::{Contributor, top_contributors};
pub use attribution::propagator::{
    APPROXIMATION_LABEL, AttributionAnalysis, AttributionPropagator, AttributionResult,
    LayerAttribution,
};
pub use attribution::reduction::{HeatmapEntry, ReductionPolicy, TokenHeatmap, token_heatmap};
pub use attribution::stats::{
    AttentionEvolution, CleanAttention, FirstTokenShare, FirstTokenTrace, LayerDistributionStats,
    PositionStats, TokenDynamics,
};

// --- Inputs -------------------------------------------------------------
pub use cache::AttentionCache;
pub use matrix::LayerAttentionMatrix;

// --- Config, errors, reports --------------------------------------------
pub use config::AttributionConfig;
pub use error::{AttributionError, Result};
pub use report::{HeatmapGrid, HeatmapScale, SpectrogramGrid};
