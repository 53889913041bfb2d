// SPDX-License-Identifier: MIT OR Apache-2.0

//! Causal attention masks.
//!
//! Used to turn raw `q·k` scores into causal attention patterns, e.g. when
//! building synthetic layers for tests and demos.

use candle_core::{D, DType, Device, Tensor};

use crate::error::{AttributionError, Result};

/// Create a causal mask: `0` on and below the diagonal, `-inf` above.
///
/// # Shapes
/// - returns: `[seq_len, seq_len]`
///
/// # Errors
///
/// Returns [`AttributionError::Tensor`] on tensor construction failure.
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mut mask_data = vec![0.0_f64; seq_len * seq_len];
    for (idx, cell) in mask_data.iter_mut().enumerate() {
        if idx % seq_len > idx / seq_len {
            *cell = f64::NEG_INFINITY;
        }
    }
    Ok(Tensor::from_vec(mask_data, (seq_len, seq_len), device)?.to_dtype(dtype)?)
}

/// Apply the causal mask to attention scores and softmax over keys.
///
/// Every output row `q` is a probability distribution over key positions
/// `<= q`.
///
/// # Shapes
/// - `scores`: `[..., seq, seq]`
/// - returns: same shape as `scores`
///
/// # Errors
///
/// Returns [`AttributionError::ShapeMismatch`] if the last two dimensions
/// are missing or unequal.
pub fn causal_softmax(scores: &Tensor) -> Result<Tensor> {
    let (seq_q, seq_k) = match scores.dims() {
        [.., q, k] => (*q, *k),
        _ => {
            return Err(AttributionError::ShapeMismatch(format!(
                "causal softmax needs [..., seq, seq] scores, got shape {:?}",
                scores.dims()
            )));
        }
    };
    if seq_q != seq_k {
        return Err(AttributionError::ShapeMismatch(format!(
            "causal softmax needs square scores, got {seq_q}x{seq_k}"
        )));
    }
    let mask = create_causal_mask(seq_q, scores.device(), scores.dtype())?;
    let masked = scores.broadcast_add(&mask)?;
    Ok(candle_nn::ops::softmax(&masked, D::Minus1)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
