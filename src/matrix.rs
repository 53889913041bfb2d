// SPDX-License-Identifier: MIT OR Apache-2.0

//! Head-averaged per-layer attention matrices.
//!
//! A [`LayerAttentionMatrix`] is the `[seq, seq]` matrix obtained by
//! averaging one layer's `[heads, seq_q, seq_k]` attention tensor over the
//! head axis.  All matrices are promoted to `F64` on the CPU so that
//! attribution chains across many layers stay within `1e-9` of the exact
//! product.

use candle_core::{DType, Device, Tensor};

use crate::error::{AttributionError, Result};

/// One layer's attention, averaged over heads.
///
/// Entry `(q, k)` is the weight query position `q` places on key position
/// `k`.  For causal attention produced by a masked softmax every row is a
/// probability distribution over positions `<= q`.
///
/// # Example
///
/// ```
/// use attn_attrib::LayerAttentionMatrix;
///
/// let m = LayerAttentionMatrix::from_rows(&[
///     vec![1.0, 0.0],
///     vec![0.5, 0.5],
/// ]).unwrap();
/// assert_eq!(m.seq_len(), 2);
/// assert_eq!(m.row(1).unwrap(), vec![0.5, 0.5]);
/// ```
#[derive(Debug, Clone)]
pub struct LayerAttentionMatrix {
    /// Shape `[seq_len, seq_len]`, dtype `F64`, CPU.
    data: Tensor,
    /// Cached side length.
    seq_len: usize,
}

impl LayerAttentionMatrix {
    /// Average a raw attention tensor over its head axis.
    ///
    /// `matrix[q][k] = mean over h of tensor[h][q][k]`.  Any float dtype is
    /// accepted and promoted to `F64` before averaging.
    ///
    /// # Shapes
    ///
    /// - `tensor`: `[heads, seq_q, seq_k]` with `seq_q == seq_k`
    /// - returns: `[seq, seq]`
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::ShapeMismatch`] if the tensor is not 3-D,
    /// has zero heads, or has unequal query/key extents.
    pub fn from_head_tensor(tensor: &Tensor) -> Result<Self> {
        let &[heads, seq_q, seq_k] = tensor.dims() else {
            return Err(AttributionError::ShapeMismatch(format!(
                "expected [heads, seq_q, seq_k] attention tensor, got shape {:?}",
                tensor.dims()
            )));
        };
        if heads == 0 {
            return Err(AttributionError::ShapeMismatch(
                "attention tensor has zero heads".into(),
            ));
        }
        if seq_q != seq_k {
            return Err(AttributionError::ShapeMismatch(format!(
                "attention tensor is not square: seq_q={seq_q}, seq_k={seq_k}"
            )));
        }

        // PROMOTE: averaging attention weights; compute in F64 for precision
        let promoted = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F64)?;
        let data = promoted.mean(0)?;
        Ok(Self {
            data,
            seq_len: seq_q,
        })
    }

    /// Wrap an already head-averaged `[seq, seq]` tensor.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::ShapeMismatch`] if the tensor is not a
    /// square 2-D matrix.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let &[rows, cols] = tensor.dims() else {
            return Err(AttributionError::ShapeMismatch(format!(
                "expected [seq, seq] matrix, got shape {:?}",
                tensor.dims()
            )));
        };
        if rows != cols {
            return Err(AttributionError::ShapeMismatch(format!(
                "attention matrix is not square: {rows}x{cols}"
            )));
        }
        let data = tensor
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F64)?
            .contiguous()?;
        Ok(Self {
            data,
            seq_len: rows,
        })
    }

    /// Build a matrix from row vectors.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::ShapeMismatch`] if any row length differs
    /// from the number of rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let seq_len = rows.len();
        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != seq_len) {
            return Err(AttributionError::ShapeMismatch(format!(
                "row {idx} has {} entries, expected {seq_len} for a square matrix",
                row.len()
            )));
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let data = Tensor::from_vec(flat, (seq_len, seq_len), &Device::Cpu)?;
        Ok(Self { data, seq_len })
    }

    /// The `seq_len x seq_len` identity (attention that only looks at itself).
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::Tensor`] if allocation fails.
    pub fn identity(seq_len: usize) -> Result<Self> {
        let flat: Vec<f64> = (0..seq_len)
            .flat_map(|q| (0..seq_len).map(move |k| if q == k { 1.0 } else { 0.0 }))
            .collect();
        let data = Tensor::from_vec(flat, (seq_len, seq_len), &Device::Cpu)?;
        Ok(Self { data, seq_len })
    }

    /// Side length of the matrix (the sequence length).
    #[must_use]
    pub const fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Underlying `[seq, seq]` `F64` tensor.
    #[must_use]
    pub const fn as_tensor(&self) -> &Tensor {
        &self.data
    }

    /// Attention weights FROM query position `query` over all keys.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::InvalidPosition`] if `query >= seq_len`.
    pub fn row(&self, query: usize) -> Result<Vec<f64>> {
        if query >= self.seq_len {
            return Err(AttributionError::InvalidPosition {
                target: query.into(),
                seq_len: self.seq_len,
            });
        }
        Ok(self.data.get(query)?.to_vec1()?)
    }

    /// All rows as nested vectors.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::Tensor`] on extraction failure.
    pub fn to_rows(&self) -> Result<Vec<Vec<f64>>> {
        Ok(self.data.to_vec2()?)
    }

    /// Sum of each row (`1.0` per row for an unmasked softmax).
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::Tensor`] on reduction failure.
    pub fn row_sums(&self) -> Result<Vec<f64>> {
        Ok(self.data.sum(1)?.to_vec1()?)
    }

    /// Whether every entry is non-negative and every row sums to at most
    /// `1 + tolerance`.
    ///
    /// Rows that sum to less than one (masked positions) are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::Tensor`] on extraction failure.
    pub fn is_row_stochastic(&self, tolerance: f64) -> Result<bool> {
        let rows = self.to_rows()?;
        Ok(rows.iter().all(|row| {
            row.iter().all(|&w| w >= -tolerance) && row.iter().sum::<f64>() <= 1.0 + tolerance
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn head_average_matches_hand_computation() {
        // 2 heads, 2x2: head 0 identity, head 1 all attention on position 0.
        #[rustfmt::skip]
        let data: Vec<f32> = vec![
            1.0, 0.0,
            0.0, 1.0,
            1.0, 0.0,
            1.0, 0.0,
        ];
        let tensor = Tensor::from_vec(data, (2, 2, 2), &Device::Cpu).unwrap();
        let m = LayerAttentionMatrix::from_head_tensor(&tensor).unwrap();

        assert_eq!(m.seq_len(), 2);
        let rows = m.to_rows().unwrap();
        assert!((rows[0][0] - 1.0).abs() < 1e-12);
        assert!((rows[0][1] - 0.0).abs() < 1e-12);
        assert!((rows[1][0] - 0.5).abs() < 1e-12);
        assert!((rows[1][1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn head_average_is_order_independent() {
        let a: Vec<f64> = vec![0.2, 0.8, 0.6, 0.4, 0.9, 0.1, 0.3, 0.7];
        let b: Vec<f64> = vec![0.9, 0.1, 0.3, 0.7, 0.2, 0.8, 0.6, 0.4];
        let ta = Tensor::from_vec(a, (2, 2, 2), &Device::Cpu).unwrap();
        let tb = Tensor::from_vec(b, (2, 2, 2), &Device::Cpu).unwrap();

        let ma = LayerAttentionMatrix::from_head_tensor(&ta).unwrap();
        let mb = LayerAttentionMatrix::from_head_tensor(&tb).unwrap();
        let ra = ma.to_rows().unwrap();
        let rb = mb.to_rows().unwrap();
        for (x, y) in ra.iter().flatten().zip(rb.iter().flatten()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn head_tensor_wrong_rank() {
        let t = Tensor::zeros((1, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let err = LayerAttentionMatrix::from_head_tensor(&t).unwrap_err();
        assert!(matches!(err, AttributionError::ShapeMismatch(_)));
    }

    #[test]
    fn head_tensor_not_square() {
        let t = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            LayerAttentionMatrix::from_head_tensor(&t),
            Err(AttributionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn head_tensor_zero_heads() {
        let t = Tensor::zeros((0, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            LayerAttentionMatrix::from_head_tensor(&t),
            Err(AttributionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn from_rows_rejects_ragged() {
        let err = LayerAttentionMatrix::from_rows(&[vec![1.0, 0.0], vec![1.0]]).unwrap_err();
        assert!(matches!(err, AttributionError::ShapeMismatch(_)));
    }

    #[test]
    fn from_tensor_rejects_rectangular() {
        let t = Tensor::zeros((2, 3), DType::F64, &Device::Cpu).unwrap();
        assert!(LayerAttentionMatrix::from_tensor(&t).is_err());
    }

    #[test]
    fn identity_rows() {
        let m = LayerAttentionMatrix::identity(3).unwrap();
        assert_eq!(m.row(1).unwrap(), vec![0.0, 1.0, 0.0]);
        assert_eq!(m.row_sums().unwrap(), vec![1.0, 1.0, 1.0]);
        assert!(m.is_row_stochastic(1e-12).unwrap());
    }

    #[test]
    fn row_out_of_range() {
        let m = LayerAttentionMatrix::identity(3).unwrap();
        assert!(matches!(
            m.row(3),
            Err(AttributionError::InvalidPosition { seq_len: 3, .. })
        ));
    }

    #[test]
    fn row_stochastic_detects_excess_mass() {
        let m = LayerAttentionMatrix::from_rows(&[vec![0.9, 0.3], vec![0.5, 0.5]]).unwrap();
        assert!(!m.is_row_stochastic(1e-9).unwrap());
    }
}
