// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for attn-attrib.

use crate::attribution::TargetPosition;

/// Errors that can occur while reducing or propagating attention.
///
/// Every error is raised by up-front validation, before any arithmetic
/// runs, so a failed call never leaves a partial result behind.
#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    /// Tensor operation failure (wraps candle).
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Matrices, tensors, vectors or token labels disagree on their shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Target or query position outside `[0, seq_len)`.
    #[error("invalid position {target} for sequence of length {seq_len}")]
    InvalidPosition {
        /// The position that was requested.
        target: TargetPosition,
        /// Length of the sequence it was resolved against.
        seq_len: usize,
    },

    /// Layer index not present in an attention cache.
    #[error("layer {layer} out of range ({n_layers} layers cached)")]
    LayerOutOfRange {
        /// The layer that was requested.
        layer: usize,
        /// Number of layers available.
        n_layers: usize,
    },

    /// No layers (or no vectors) were supplied.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type alias for attn-attrib operations.
pub type Result<T> = std::result::Result<T, AttributionError>;
