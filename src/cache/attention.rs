// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention pattern cache for storing and querying per-layer attention weights.
//!
//! [`AttentionCache`] stores post-softmax attention patterns captured from
//! each layer of a forward pass and hands them to the attribution code as
//! head-averaged [`LayerAttentionMatrix`] values.
//!
//! Each stored tensor has shape `[batch, heads, seq_q, seq_k]`.  Queries read
//! batch index 0.

use candle_core::{DType, Tensor};

use crate::attribution::TargetPosition;
use crate::attribution::contributors::ranked_positions;
use crate::error::{AttributionError, Result};
use crate::matrix::LayerAttentionMatrix;

/// Stores per-layer attention weights from a forward pass.
///
/// Each tensor has shape `[batch, heads, seq_q, seq_k]`: the post-softmax
/// attention pattern for one layer.
///
/// # Example
///
/// ```
/// use attn_attrib::AttentionCache;
/// use candle_core::{DType, Device, Tensor};
///
/// let mut cache = AttentionCache::with_capacity(2);
/// // shape [batch=1, heads=4, seq=6, seq=6]
/// cache.push(Tensor::ones((1, 4, 6, 6), DType::F32, &Device::Cpu).unwrap()).unwrap();
///
/// // What position 5 attends to in layer 0
/// let row = cache.attention_from_position(0, 5).unwrap();
/// assert_eq!(row.len(), 6);
/// ```
#[derive(Debug, Default)]
pub struct AttentionCache {
    /// Attention patterns per layer, each shape `[batch, heads, seq_q, seq_k]`.
    patterns: Vec<Tensor>,
}

impl AttentionCache {
    /// Create an empty cache with capacity for `n_layers` layers.
    #[must_use]
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            patterns: Vec::with_capacity(n_layers),
        }
    }

    /// Add an attention pattern for the next layer.
    ///
    /// # Shapes
    ///
    /// - `pattern`: `[batch, heads, seq_q, seq_k]`
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::ShapeMismatch`] if the pattern is not
    /// 4-D or has an empty batch or head axis.
    pub fn push(&mut self, pattern: Tensor) -> Result<()> {
        if !matches!(pattern.dims(), &[batch, heads, _, _] if batch > 0 && heads > 0) {
            return Err(AttributionError::ShapeMismatch(format!(
                "expected [batch, heads, seq_q, seq_k] attention pattern, got shape {:?}",
                pattern.dims()
            )));
        }
        self.patterns.push(pattern);
        Ok(())
    }

    /// Number of cached layers.
    #[must_use]
    pub const fn n_layers(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Get the raw attention tensor for a specific layer.
    ///
    /// # Shapes
    ///
    /// - returns: `[batch, heads, seq_q, seq_k]`
    #[must_use]
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.patterns.get(layer)
    }

    /// All cached patterns as a slice.
    #[must_use]
    pub fn patterns(&self) -> &[Tensor] {
        &self.patterns
    }

    /// Get attention weights FROM a specific query position, averaged across heads.
    ///
    /// Returns a vector of length `seq_k`: how much `position` attends to
    /// every key position, averaged over all heads (batch index 0).
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::LayerOutOfRange`] if the layer is not in
    /// the cache and [`AttributionError::InvalidPosition`] if the position
    /// is out of range.
    pub fn attention_from_position(&self, layer: usize, position: usize) -> Result<Vec<f64>> {
        let batch0 = self.batch0(layer)?;
        // batch0: [heads, seq_q, seq_k]
        check_position(position, batch0.dim(1)?)?;
        // narrow(dim=1, start=position, len=1) → [heads, 1, seq_k] → [heads, seq_k]
        let row = batch0.narrow(1, position, 1)?.squeeze(1)?;
        Ok(row.mean(0)?.to_vec1()?)
    }

    /// Get attention weights TO a specific key position, averaged across heads.
    ///
    /// Returns a vector of length `seq_q`: how much every query position
    /// attends to `position`, averaged over all heads (batch index 0).
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::LayerOutOfRange`] if the layer is not in
    /// the cache and [`AttributionError::InvalidPosition`] if the position
    /// is out of range.
    pub fn attention_to_position(&self, layer: usize, position: usize) -> Result<Vec<f64>> {
        let batch0 = self.batch0(layer)?;
        check_position(position, batch0.dim(2)?)?;
        // narrow(dim=2, start=position, len=1) → [heads, seq_q, 1] → [heads, seq_q]
        let col = batch0.narrow(2, position, 1)?.squeeze(2)?;
        Ok(col.mean(0)?.to_vec1()?)
    }

    /// Get the top-k key positions that a given query position attends to most.
    ///
    /// Returns up to `k` `(key_position, weight)` pairs sorted by descending
    /// head-averaged weight; equal weights keep ascending position order.
    ///
    /// # Errors
    ///
    /// Same as [`attention_from_position`](Self::attention_from_position).
    pub fn top_attended_positions(
        &self,
        layer: usize,
        from_position: usize,
        k: usize,
    ) -> Result<Vec<(usize, f64)>> {
        let attn = self.attention_from_position(layer, from_position)?;
        Ok(ranked_positions(&attn, k))
    }

    /// Head-averaged attention matrix of one layer (batch index 0).
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::LayerOutOfRange`] for an unknown layer
    /// and [`AttributionError::ShapeMismatch`] for a non-square pattern.
    pub fn layer_matrix(&self, layer: usize) -> Result<LayerAttentionMatrix> {
        LayerAttentionMatrix::from_head_tensor(&self.batch0(layer)?)
    }

    /// Every cached layer as a head-averaged matrix, layer 0 first.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::ShapeMismatch`] if any pattern is not
    /// square.
    pub fn layer_matrices(&self) -> Result<Vec<LayerAttentionMatrix>> {
        (0..self.patterns.len())
            .map(|layer| self.layer_matrix(layer))
            .collect()
    }

    /// Batch 0 of a layer's pattern, promoted to `F64`.
    ///
    /// # Shapes
    ///
    /// - returns: `[heads, seq_q, seq_k]`
    fn batch0(&self, layer: usize) -> Result<Tensor> {
        let pattern = self
            .patterns
            .get(layer)
            .ok_or(AttributionError::LayerOutOfRange {
                layer,
                n_layers: self.patterns.len(),
            })?;
        // PROMOTE: averaging attention weights; compute in F64 for precision
        let batch0 = pattern.narrow(0, 0, 1)?.squeeze(0)?;
        Ok(batch0.to_dtype(DType::F64)?)
    }
}

/// Reject a position outside `[0, len)`.
fn check_position(position: usize, len: usize) -> Result<()> {
    if position >= len {
        return Err(AttributionError::InvalidPosition {
            target: TargetPosition::Index(position),
            seq_len: len,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
