// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cross-layer attention attribution.
//!
//! Traces how much each input position contributes to a target position
//! by chaining head-averaged attention matrices across layers, much like
//! PageRank propagates importance along graph edges.
//!
//! Two methods are computed side by side:
//!
//! - **Iterative**: start from a one-hot vector at the target and, walking
//!   from the last layer to the first, replace it with `v · A_layer`.  Each
//!   intermediate vector is kept as the layer-by-layer trace.
//! - **Composite**: multiply all layers in forward order,
//!   `C = A_0 · A_1 · … · A_{L-1}`, and read row `target` of `C`.
//!
//! ## Approximation
//!
//! Both methods treat attention as the only transformation between layers.
//! The MLP blocks, residual connections and normalization that a real
//! forward pass applies between attention layers are ignored, so the
//! result is a *linear approximation* of attribution, not an exact
//! decomposition.  Reports carry [`APPROXIMATION_LABEL`] for this reason.

use candle_core::{Device, Tensor};

use super::contributors::{Contributor, top_contributors};
use super::reduction::ReductionPolicy;
use super::{TargetPosition, l1_norm};
use crate::config::AttributionConfig;
use crate::error::{AttributionError, Result};
use crate::matrix::LayerAttentionMatrix;

/// Default number of contributors reported for the final attribution.
pub const DEFAULT_TOP_K: usize = 10;

/// Default number of contributors reported at each propagation step.
pub const DEFAULT_LAYER_TOP_K: usize = 5;

/// Label attached to every serialized attribution result.
pub const APPROXIMATION_LABEL: &str = "linear attention composition";

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Attribution vector recorded after propagating through one layer.
#[derive(Debug, Clone)]
pub struct LayerAttribution {
    /// Layer index (0-indexed).
    pub layer: usize,
    /// Attribution over all positions after this layer's step.
    pub vector: Vec<f64>,
    /// Top contributors of [`vector`](Self::vector).
    pub top_contributors: Vec<Contributor>,
}

/// Attribution of one target position.
#[derive(Debug, Clone)]
pub struct AttributionResult {
    /// Resolved target position.
    pub target_position: usize,
    /// Token label at the target position.
    pub target_token: String,
    /// Iterative trace, ordered from layer 0 to the last layer.
    pub layer_trace: Vec<LayerAttribution>,
    /// Row `target_position` of the composite matrix.
    pub final_attribution: Vec<f64>,
    /// Top contributors of [`final_attribution`](Self::final_attribution).
    pub final_top_contributors: Vec<Contributor>,
}

impl AttributionResult {
    /// L1 norm of each trace vector, in trace order (layer 0 first).
    ///
    /// For row-stochastic layers the norms are non-increasing in
    /// propagation order, i.e. non-decreasing in layer index here.
    #[must_use]
    pub fn trace_l1_norms(&self) -> Vec<f64> {
        self.layer_trace.iter().map(|l| l1_norm(&l.vector)).collect()
    }

    /// L1 norm of the composite attribution.
    #[must_use]
    pub fn final_l1_norm(&self) -> f64 {
        l1_norm(&self.final_attribution)
    }

    /// Collapse the layer trace into one vector with a reduction policy.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::EmptyInput`] if the trace is empty.
    pub fn reduce_trace(&self, policy: ReductionPolicy) -> Result<Vec<f64>> {
        let vectors: Vec<Vec<f64>> = self.layer_trace.iter().map(|l| l.vector.clone()).collect();
        policy.reduce(&vectors)
    }

    /// Print the target and its top-3 contributors.
    pub fn print_summary(&self) {
        println!(
            "position {} (token: \"{}\")",
            self.target_position,
            super::contributors::format_token(&self.target_token)
        );
        println!("  Top 3 final contributors:");
        for (i, c) in self.final_top_contributors.iter().take(3).enumerate() {
            println!("    {}. {c}", i + 1);
        }
    }
}

/// Attribution of several targets over the same sequence.
#[derive(Debug, Clone)]
pub struct AttributionAnalysis {
    /// Token labels aligned by position.
    pub tokens: Vec<String>,
    /// `A_0 · A_1 · … · A_{L-1}`, shared by every result.
    pub composite_matrix: Vec<Vec<f64>>,
    /// Number of layers chained.
    pub n_layers: usize,
    /// One result per requested target, in request order.
    pub results: Vec<AttributionResult>,
}

impl AttributionAnalysis {
    /// Result for a resolved target position, if it was analyzed.
    #[must_use]
    pub fn get(&self, position: usize) -> Option<&AttributionResult> {
        self.results.iter().find(|r| r.target_position == position)
    }

    /// Print every result's summary.
    pub fn print_summary(&self) {
        println!("=== Attribution Analysis ===");
        println!("{} tokens, {} layers", self.tokens.len(), self.n_layers);
        for result in &self.results {
            println!();
            result.print_summary();
        }
    }
}

// ---------------------------------------------------------------------------
// AttributionPropagator
// ---------------------------------------------------------------------------

/// Propagates attribution mass backward through per-layer attention.
///
/// The propagator is a pure function of its inputs: the layer matrices and
/// token labels are injected at construction, and no call mutates them.
///
/// # Example
///
/// ```
/// use attn_attrib::{AttributionPropagator, LayerAttentionMatrix, TargetPosition};
///
/// let layer = LayerAttentionMatrix::from_rows(&[
///     vec![1.0, 0.0],
///     vec![0.25, 0.75],
/// ]).unwrap();
/// let tokens = vec!["<s>".to_string(), "hi".to_string()];
/// let propagator = AttributionPropagator::new(vec![layer], tokens).unwrap();
///
/// let result = propagator.compute(TargetPosition::LAST).unwrap();
/// assert_eq!(result.target_position, 1);
/// assert!((result.final_attribution[0] - 0.25).abs() < 1e-12);
/// ```
#[derive(Debug, Clone)]
pub struct AttributionPropagator {
    /// Head-averaged attention, layer 0 first.
    layers: Vec<LayerAttentionMatrix>,
    /// Token labels aligned by position.
    tokens: Vec<String>,
    /// Shared side length of every layer matrix.
    seq_len: usize,
    /// Contributors reported for the final attribution.
    top_k: usize,
    /// Contributors reported at each propagation step.
    layer_top_k: usize,
}

impl AttributionPropagator {
    /// Create a propagator over `layers` with `tokens` aligned by position.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::EmptyInput`] if `layers` is empty and
    /// [`AttributionError::ShapeMismatch`] if the layers differ in size or
    /// the token count differs from the sequence length.
    pub fn new(layers: Vec<LayerAttentionMatrix>, tokens: Vec<String>) -> Result<Self> {
        let seq_len = layers
            .first()
            .map(LayerAttentionMatrix::seq_len)
            .ok_or_else(|| AttributionError::EmptyInput("no layer matrices supplied".into()))?;

        if let Some((idx, layer)) = layers
            .iter()
            .enumerate()
            .find(|(_, l)| l.seq_len() != seq_len)
        {
            return Err(AttributionError::ShapeMismatch(format!(
                "layer {idx} is {n}x{n}, layer 0 is {seq_len}x{seq_len}",
                n = layer.seq_len()
            )));
        }
        if tokens.len() != seq_len {
            return Err(AttributionError::ShapeMismatch(format!(
                "{} token labels for a sequence of length {seq_len}",
                tokens.len()
            )));
        }

        Ok(Self {
            layers,
            tokens,
            seq_len,
            top_k: DEFAULT_TOP_K,
            layer_top_k: DEFAULT_LAYER_TOP_K,
        })
    }

    /// Create a propagator from raw `[heads, seq, seq]` tensors, one per
    /// layer, averaging each over its heads.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new), plus any head-reduction shape error.
    pub fn from_head_tensors(tensors: &[Tensor], tokens: Vec<String>) -> Result<Self> {
        let layers = tensors
            .iter()
            .map(LayerAttentionMatrix::from_head_tensor)
            .collect::<Result<Vec<_>>>()?;
        Self::new(layers, tokens)
    }

    /// Set the number of final contributors to report.
    #[must_use]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set the number of contributors to report at each layer.
    #[must_use]
    pub const fn with_layer_top_k(mut self, layer_top_k: usize) -> Self {
        self.layer_top_k = layer_top_k;
        self
    }

    /// Apply the top-k settings of a configuration.
    #[must_use]
    pub const fn with_config(self, config: &AttributionConfig) -> Self {
        self.with_top_k(config.top_k)
            .with_layer_top_k(config.layer_top_k)
    }

    /// Sequence length shared by every layer.
    #[must_use]
    pub const fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Number of layers chained.
    #[must_use]
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Token labels aligned by position.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Layer matrices, layer 0 first.
    #[must_use]
    pub fn layers(&self) -> &[LayerAttentionMatrix] {
        &self.layers
    }

    /// The last three positions (fewer for shorter sequences).
    #[must_use]
    pub fn default_targets(&self) -> Vec<TargetPosition> {
        (self.seq_len.saturating_sub(3)..self.seq_len)
            .map(TargetPosition::Index)
            .collect()
    }

    // --- Iterative method -------------------------------------------------

    /// Propagate a one-hot vector at `target` from the last layer to the
    /// first.
    ///
    /// Returns `(layer, vector)` pairs ordered from layer 0 to the last
    /// layer; the entry for layer 0 is the fully propagated vector.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::InvalidPosition`] if `target` is out of
    /// range.
    pub fn propagate_iterative(&self, target: TargetPosition) -> Result<Vec<(usize, Vec<f64>)>> {
        let position = target.resolve(self.seq_len)?;
        self.iterative_from(position)
    }

    /// Iterative propagation from an already-resolved position.
    fn iterative_from(&self, position: usize) -> Result<Vec<(usize, Vec<f64>)>> {
        let mut current = one_hot(self.seq_len, position)?;
        let mut trace = Vec::with_capacity(self.layers.len());

        for (layer, matrix) in self.layers.iter().enumerate().rev() {
            // [1, seq] x [seq, seq] -> [1, seq]
            current = current.matmul(matrix.as_tensor())?;
            let vector: Vec<f64> = current.squeeze(0)?.to_vec1()?;
            trace.push((layer, vector));
        }

        trace.reverse();
        Ok(trace)
    }

    // --- Composite method -------------------------------------------------

    /// Product of all layer matrices in forward order.
    ///
    /// This is the linear approximation described in the module docs.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::Tensor`] if a matrix product fails.
    pub fn composite_matrix(&self) -> Result<LayerAttentionMatrix> {
        let mut layers = self.layers.iter();
        let first = layers
            .next()
            .ok_or_else(|| AttributionError::EmptyInput("no layer matrices supplied".into()))?;
        let mut composite = first.as_tensor().clone();
        for matrix in layers {
            composite = composite.matmul(matrix.as_tensor())?;
        }
        LayerAttentionMatrix::from_tensor(&composite)
    }

    /// Row `target` of the composite matrix.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::InvalidPosition`] if `target` is out of
    /// range.
    pub fn propagate_composite(&self, target: TargetPosition) -> Result<Vec<f64>> {
        let position = target.resolve(self.seq_len)?;
        self.composite_matrix()?.row(position)
    }

    // --- Full results -----------------------------------------------------

    /// Run both methods for one target.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::Config`] if a top-k setting is zero and
    /// [`AttributionError::InvalidPosition`] if `target` is out of range.
    pub fn compute(&self, target: TargetPosition) -> Result<AttributionResult> {
        self.check_top_k()?;
        let position = target.resolve(self.seq_len)?;
        let composite = self.composite_matrix()?;
        self.result_for(position, &composite)
    }

    /// Run both methods for several targets, sharing one composite matrix.
    ///
    /// All targets are resolved before any arithmetic, so an invalid one
    /// fails the whole call.
    ///
    /// # Errors
    ///
    /// Returns [`AttributionError::Config`] if a top-k setting is zero and
    /// [`AttributionError::InvalidPosition`] if any target is out of range.
    pub fn analyze_positions(&self, targets: &[TargetPosition]) -> Result<AttributionAnalysis> {
        self.check_top_k()?;
        let positions = targets
            .iter()
            .map(|t| t.resolve(self.seq_len))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            seq_len = self.seq_len,
            n_layers = self.layers.len(),
            targets = ?positions,
            "computing attention attribution",
        );

        let composite = self.composite_matrix()?;
        let results = positions
            .iter()
            .map(|&p| self.result_for(p, &composite))
            .collect::<Result<Vec<_>>>()?;

        Ok(AttributionAnalysis {
            tokens: self.tokens.clone(),
            composite_matrix: composite.to_rows()?,
            n_layers: self.layers.len(),
            results,
        })
    }

    /// Assemble a result for a resolved position.
    fn result_for(
        &self,
        position: usize,
        composite: &LayerAttentionMatrix,
    ) -> Result<AttributionResult> {
        let layer_trace = self
            .iterative_from(position)?
            .into_iter()
            .map(|(layer, vector)| {
                let top = top_contributors(&vector, &self.tokens, self.layer_top_k);
                if let Some(first) = top.first() {
                    tracing::debug!(
                        layer,
                        position = first.position,
                        score = first.score,
                        "top contributor after layer",
                    );
                }
                LayerAttribution {
                    layer,
                    vector,
                    top_contributors: top,
                }
            })
            .collect();

        let final_attribution = composite.row(position)?;
        let final_top_contributors = top_contributors(&final_attribution, &self.tokens, self.top_k);

        Ok(AttributionResult {
            target_position: position,
            target_token: self.tokens.get(position).cloned().unwrap_or_default(),
            layer_trace,
            final_attribution,
            final_top_contributors,
        })
    }

    /// Reject zero top-k settings.
    fn check_top_k(&self) -> Result<()> {
        if self.top_k == 0 || self.layer_top_k == 0 {
            return Err(AttributionError::Config(format!(
                "top_k and layer_top_k must be positive (got {} and {})",
                self.top_k, self.layer_top_k
            )));
        }
        Ok(())
    }
}

/// `[1, seq_len]` row vector with `1.0` at `position`.
fn one_hot(seq_len: usize, position: usize) -> Result<Tensor> {
    let data: Vec<f64> = (0..seq_len)
        .map(|i| if i == position { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(data, (1, seq_len), &Device::Cpu)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use super::*;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tok{i}")).collect()
    }

    /// Causal 4x4 layer with heavy first-token attention.
    fn sink_layer() -> LayerAttentionMatrix {
        LayerAttentionMatrix::from_rows(&[
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.8, 0.2, 0.0, 0.0],
            vec![0.7, 0.2, 0.1, 0.0],
            vec![0.6, 0.1, 0.1, 0.2],
        ])
        .unwrap()
    }

    /// Causal 4x4 layer with mostly local attention.
    fn local_layer() -> LayerAttentionMatrix {
        LayerAttentionMatrix::from_rows(&[
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.5, 0.5, 0.0, 0.0],
            vec![0.1, 0.4, 0.5, 0.0],
            vec![0.1, 0.1, 0.3, 0.5],
        ])
        .unwrap()
    }

    fn two_layer_propagator() -> AttributionPropagator {
        AttributionPropagator::new(vec![sink_layer(), local_layer()], labels(4)).unwrap()
    }

    #[test]
    fn empty_layers_rejected() {
        let err = AttributionPropagator::new(Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, AttributionError::EmptyInput(_)));
    }

    #[test]
    fn mismatched_layer_sizes_rejected() {
        let layers = vec![
            LayerAttentionMatrix::identity(4).unwrap(),
            LayerAttentionMatrix::identity(5).unwrap(),
        ];
        let err = AttributionPropagator::new(layers, labels(4)).unwrap_err();
        assert!(matches!(err, AttributionError::ShapeMismatch(_)));
    }

    #[test]
    fn token_count_mismatch_rejected() {
        let err = AttributionPropagator::new(vec![sink_layer()], labels(3)).unwrap_err();
        assert!(matches!(err, AttributionError::ShapeMismatch(_)));
    }

    #[test]
    fn target_one_past_end_rejected() {
        let p = two_layer_propagator();
        let err = p.compute(TargetPosition::Index(4)).unwrap_err();
        assert!(matches!(
            err,
            AttributionError::InvalidPosition {
                target: TargetPosition::Index(4),
                seq_len: 4
            }
        ));
    }

    #[test]
    fn zero_top_k_rejected() {
        let p = two_layer_propagator().with_top_k(0);
        assert!(matches!(
            p.compute(TargetPosition::LAST),
            Err(AttributionError::Config(_))
        ));
    }

    #[test]
    fn single_layer_target_zero_is_row_zero() {
        let layer = sink_layer();
        let p = AttributionPropagator::new(vec![layer.clone()], labels(4)).unwrap();
        let result = p.compute(TargetPosition::Index(0)).unwrap();
        assert_eq!(result.final_attribution, layer.row(0).unwrap());
        assert_eq!(result.layer_trace[0].vector, layer.row(0).unwrap());
    }

    #[test]
    fn identity_layer_is_noop() {
        let p =
            AttributionPropagator::new(vec![LayerAttentionMatrix::identity(4).unwrap()], labels(4))
                .unwrap();
        let result = p.compute(TargetPosition::Index(2)).unwrap();
        assert_eq!(result.final_attribution, vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(result.layer_trace[0].vector, vec![0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn trace_ordered_from_first_layer() {
        let p = two_layer_propagator();
        let trace = p.propagate_iterative(TargetPosition::LAST).unwrap();
        let layers: Vec<usize> = trace.iter().map(|(l, _)| *l).collect();
        assert_eq!(layers, vec![0, 1]);

        // Last layer step: row 3 of the local layer.
        assert_eq!(trace[1].1, local_layer().row(3).unwrap());
    }

    #[test]
    fn iterative_two_layers_hand_computed() {
        // v = e3 · local = [0.1, 0.1, 0.3, 0.5]
        // v · sink = 0.1*[1,0,0,0] + 0.1*[0.8,0.2,0,0] + 0.3*[0.7,0.2,0.1,0]
        //          + 0.5*[0.6,0.1,0.1,0.2]
        //          = [0.69, 0.13, 0.08, 0.10]
        let p = two_layer_propagator();
        let trace = p.propagate_iterative(TargetPosition::LAST).unwrap();
        let expected = [0.69, 0.13, 0.08, 0.10];
        for (got, want) in trace[0].1.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
    }

    #[test]
    fn composite_two_layers_hand_computed() {
        // Row 3 of sink · local:
        // 0.6*[1,0,0,0] + 0.1*[0.5,0.5,0,0] + 0.1*[0.1,0.4,0.5,0]
        // + 0.2*[0.1,0.1,0.3,0.5] = [0.68, 0.11, 0.11, 0.10]
        let p = two_layer_propagator();
        let row = p.propagate_composite(TargetPosition::LAST).unwrap();
        let expected = [0.68, 0.11, 0.11, 0.10];
        for (got, want) in row.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
    }

    #[test]
    fn l1_norms_bounded_by_one() {
        let p = two_layer_propagator();
        let result = p.compute(TargetPosition::LAST).unwrap();
        for norm in result.trace_l1_norms() {
            assert!(norm <= 1.0 + 1e-12);
        }
        assert!((result.final_l1_norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn compute_is_bit_identical_across_calls() {
        let p = two_layer_propagator();
        let a = p.compute(TargetPosition::Index(2)).unwrap();
        let b = p.compute(TargetPosition::Index(2)).unwrap();
        assert_eq!(a.final_attribution, b.final_attribution);
        for (la, lb) in a.layer_trace.iter().zip(&b.layer_trace) {
            assert_eq!(la.vector, lb.vector);
        }
    }

    #[test]
    fn top_k_limits() {
        let p = two_layer_propagator().with_top_k(2).with_layer_top_k(1);
        let result = p.compute(TargetPosition::LAST).unwrap();
        assert_eq!(result.final_top_contributors.len(), 2);
        assert!(result.layer_trace.iter().all(|l| l.top_contributors.len() == 1));
        assert_eq!(result.final_top_contributors[0].position, 0);
        assert_eq!(result.final_top_contributors[0].token, "tok0");
    }

    #[test]
    fn analyze_default_targets() {
        let p = two_layer_propagator();
        let targets = p.default_targets();
        assert_eq!(
            targets,
            vec![
                TargetPosition::Index(1),
                TargetPosition::Index(2),
                TargetPosition::Index(3)
            ]
        );
        let analysis = p.analyze_positions(&targets).unwrap();
        assert_eq!(analysis.results.len(), 3);
        assert_eq!(analysis.composite_matrix.len(), 4);
        assert_eq!(analysis.get(3).unwrap().target_token, "tok3");
        assert!(analysis.get(0).is_none());
    }

    #[test]
    fn analyze_fails_fast_on_any_invalid_target() {
        let p = two_layer_propagator();
        let err = p
            .analyze_positions(&[TargetPosition::Index(1), TargetPosition::Index(9)])
            .unwrap_err();
        assert!(matches!(err, AttributionError::InvalidPosition { .. }));
    }

    #[test]
    fn default_targets_short_sequence() {
        let p = AttributionPropagator::new(
            vec![LayerAttentionMatrix::identity(2).unwrap()],
            labels(2),
        )
        .unwrap();
        assert_eq!(p.default_targets().len(), 2);
    }

    #[test]
    fn from_head_tensors_averages() {
        // Two heads: identity and "attend to first".
        #[rustfmt::skip]
        let data: Vec<f32> = vec![
            1.0, 0.0,
            0.0, 1.0,
            1.0, 0.0,
            1.0, 0.0,
        ];
        let t = Tensor::from_vec(data, (2, 2, 2), &Device::Cpu).unwrap();
        let p = AttributionPropagator::from_head_tensors(&[t], labels(2)).unwrap();
        let row = p.propagate_composite(TargetPosition::LAST).unwrap();
        assert!((row[0] - 0.5).abs() < 1e-12);
        assert!((row[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn reduce_trace_last_layer() {
        let p = two_layer_propagator();
        let result = p.compute(TargetPosition::LAST).unwrap();
        let reduced = result.reduce_trace(ReductionPolicy::LastLayer).unwrap();
        assert_eq!(reduced, result.layer_trace[1].vector);
    }
}
