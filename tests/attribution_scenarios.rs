// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: attribution on hand-computed layer stacks, boundary
//! cases, error cases, and the capture-to-report path.
//!
//! Run:
//!   `cargo test --test attribution_scenarios`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

use attn_attrib::{
    AttentionCache, AttributionConfig, AttributionError, AttributionPropagator, HeatmapGrid,
    HeatmapScale, LayerAttentionMatrix, ReductionPolicy, TargetPosition,
};
use candle_core::{DType, Device, Tensor};

const TOL: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn labels(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("tok{i}")).collect()
}

fn matrix(rows: &[[f64; 3]]) -> LayerAttentionMatrix {
    let rows: Vec<Vec<f64>> = rows.iter().map(|r| r.to_vec()).collect();
    LayerAttentionMatrix::from_rows(&rows).unwrap()
}

/// Three row-stochastic causal layers with hand-computed products.
fn three_layers() -> Vec<LayerAttentionMatrix> {
    vec![
        matrix(&[[1.0, 0.0, 0.0], [0.5, 0.5, 0.0], [0.2, 0.3, 0.5]]),
        matrix(&[[1.0, 0.0, 0.0], [0.4, 0.6, 0.0], [0.1, 0.1, 0.8]]),
        matrix(&[[1.0, 0.0, 0.0], [0.3, 0.7, 0.0], [0.6, 0.2, 0.2]]),
    ]
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < TOL, "index {i}: {a} != {e}");
    }
}

// ---------------------------------------------------------------------------
// Hand-computed scenario
// ---------------------------------------------------------------------------

#[test]
fn three_layer_iterative_trace() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3)).unwrap();
    let trace = propagator
        .propagate_iterative(TargetPosition::Index(2))
        .unwrap();

    // e2·A2 = [0.6, 0.2, 0.2]
    // ·A1  = [0.70, 0.14, 0.16]
    // ·A0  = [0.802, 0.118, 0.08]
    assert_eq!(trace.len(), 3);
    assert_eq!(trace[0].0, 0);
    assert_close(&trace[0].1, &[0.802, 0.118, 0.08]);
    assert_close(&trace[1].1, &[0.70, 0.14, 0.16]);
    assert_close(&trace[2].1, &[0.6, 0.2, 0.2]);
}

#[test]
fn three_layer_composite_and_top_k() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3)).unwrap();
    let result = propagator.compute(TargetPosition::Index(2)).unwrap();

    // Row 2 of A0·A1 = [0.37, 0.23, 0.40]; ·A2 = [0.679, 0.241, 0.08]
    assert_close(&result.final_attribution, &[0.679, 0.241, 0.08]);
    let order: Vec<usize> = result
        .final_top_contributors
        .iter()
        .map(|c| c.position)
        .collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert_eq!(result.final_top_contributors[0].token, "tok0");
    assert_eq!(result.target_token, "tok2");

    let composite = propagator.composite_matrix().unwrap();
    assert!(composite.is_row_stochastic(TOL).unwrap());
}

#[test]
fn negative_target_matches_index() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3)).unwrap();
    let from_end = propagator.compute(TargetPosition::from_signed(-1)).unwrap();
    let absolute = propagator.compute(TargetPosition::Index(2)).unwrap();
    assert_eq!(from_end.final_attribution, absolute.final_attribution);
    assert_eq!(from_end.target_position, 2);
}

#[test]
fn trace_norms_non_increasing_in_propagation_order() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3)).unwrap();
    let result = propagator.compute(TargetPosition::Index(2)).unwrap();
    // Propagation runs from the last layer to the first.
    let norms = result.trace_l1_norms();
    for pair in norms.windows(2) {
        assert!(pair[0] <= pair[1] + TOL);
    }
    assert!(norms.iter().all(|&n| n <= 1.0 + TOL));
    assert!((result.final_l1_norm() - 1.0).abs() < TOL);
}

#[test]
fn reduce_trace_policies() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3)).unwrap();
    let result = propagator.compute(TargetPosition::Index(2)).unwrap();

    let last = result.reduce_trace(ReductionPolicy::LastLayer).unwrap();
    assert_close(&last, &[0.6, 0.2, 0.2]);

    let max = result.reduce_trace(ReductionPolicy::MaxAcrossLayers).unwrap();
    assert_close(&max, &[0.802, 0.2, 0.2]);

    let mean = result.reduce_trace(ReductionPolicy::MeanAcrossLayers).unwrap();
    assert_close(&mean, &[2.102 / 3.0, 0.458 / 3.0, 0.44 / 3.0]);
}

#[test]
fn analysis_over_default_targets() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3)).unwrap();
    let analysis = propagator
        .analyze_positions(&propagator.default_targets())
        .unwrap();
    assert_eq!(analysis.results.len(), 3);
    assert_eq!(analysis.n_layers, 3);
    assert_close(&analysis.composite_matrix[2], &[0.679, 0.241, 0.08]);
    // Row 0 of every causal layer is e0.
    assert_close(&analysis.get(0).unwrap().final_attribution, &[1.0, 0.0, 0.0]);
    assert!(analysis.get(7).is_none());
}

// ---------------------------------------------------------------------------
// Boundary cases
// ---------------------------------------------------------------------------

#[test]
fn single_layer_target_zero_is_row_zero() {
    let layer = matrix(&[[0.7, 0.2, 0.1], [0.5, 0.5, 0.0], [0.2, 0.3, 0.5]]);
    let propagator = AttributionPropagator::new(vec![layer], labels(3)).unwrap();
    let result = propagator.compute(TargetPosition::Index(0)).unwrap();
    assert_close(&result.final_attribution, &[0.7, 0.2, 0.1]);
    assert_eq!(result.layer_trace.len(), 1);
    assert_close(&result.layer_trace[0].vector, &[0.7, 0.2, 0.1]);
}

#[test]
fn identity_layer_gives_one_hot() {
    let identity = LayerAttentionMatrix::identity(4).unwrap();
    let propagator = AttributionPropagator::new(vec![identity], labels(4)).unwrap();
    let result = propagator.compute(TargetPosition::Index(2)).unwrap();
    assert_close(&result.final_attribution, &[0.0, 0.0, 1.0, 0.0]);
    assert_eq!(result.final_top_contributors[0].position, 2);
    // Zero-score ties follow position order.
    let tail: Vec<usize> = result.final_top_contributors[1..]
        .iter()
        .map(|c| c.position)
        .collect();
    assert_eq!(tail, vec![0, 1, 3]);
}

#[test]
fn single_token_sequence() {
    let layer = LayerAttentionMatrix::from_rows(&[vec![1.0]]).unwrap();
    let propagator = AttributionPropagator::new(vec![layer], labels(1)).unwrap();
    let result = propagator.compute(TargetPosition::LAST).unwrap();
    assert_close(&result.final_attribution, &[1.0]);
    assert_eq!(propagator.default_targets(), vec![TargetPosition::Index(0)]);
}

#[test]
fn top_k_truncates() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3))
        .unwrap()
        .with_top_k(1)
        .with_layer_top_k(2);
    let result = propagator.compute(TargetPosition::LAST).unwrap();
    assert_eq!(result.final_top_contributors.len(), 1);
    assert!(result.layer_trace.iter().all(|l| l.top_contributors.len() == 2));
}

// ---------------------------------------------------------------------------
// Error cases
// ---------------------------------------------------------------------------

#[test]
fn mismatched_layer_sizes() {
    let four = LayerAttentionMatrix::identity(4).unwrap();
    let five = LayerAttentionMatrix::identity(5).unwrap();
    assert!(matches!(
        AttributionPropagator::new(vec![four, five], labels(4)),
        Err(AttributionError::ShapeMismatch(_))
    ));
}

#[test]
fn target_equal_to_length() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3)).unwrap();
    assert!(matches!(
        propagator.compute(TargetPosition::Index(3)),
        Err(AttributionError::InvalidPosition { seq_len: 3, .. })
    ));
    assert!(matches!(
        propagator.analyze_positions(&[TargetPosition::Index(0), TargetPosition::Index(3)]),
        Err(AttributionError::InvalidPosition { .. })
    ));
}

#[test]
fn no_layers() {
    assert!(matches!(
        AttributionPropagator::new(Vec::new(), labels(3)),
        Err(AttributionError::EmptyInput(_))
    ));
}

#[test]
fn token_count_mismatch() {
    assert!(matches!(
        AttributionPropagator::new(three_layers(), labels(2)),
        Err(AttributionError::ShapeMismatch(_))
    ));
}

#[test]
fn zero_top_k() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3))
        .unwrap()
        .with_top_k(0);
    assert!(matches!(
        propagator.compute(TargetPosition::LAST),
        Err(AttributionError::Config(_))
    ));
}

// ---------------------------------------------------------------------------
// Concurrency and determinism
// ---------------------------------------------------------------------------

#[test]
fn parallel_invocations_agree() {
    let propagator = AttributionPropagator::new(three_layers(), labels(3)).unwrap();
    let expected = propagator.compute(TargetPosition::Index(2)).unwrap();

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| propagator.compute(TargetPosition::Index(2)).unwrap()))
            .collect();
        for handle in handles {
            let result = handle.join().unwrap();
            assert_eq!(result.final_attribution, expected.final_attribution);
            assert_eq!(
                result.layer_trace[0].vector,
                expected.layer_trace[0].vector
            );
        }
    });
}

// ---------------------------------------------------------------------------
// Capture to report
// ---------------------------------------------------------------------------

#[test]
fn cache_to_propagator_to_report() {
    // Two heads per layer whose mean is the hand-computed layer.
    let mut cache = AttentionCache::with_capacity(3);
    for layer in three_layers() {
        let rows = layer.to_rows().unwrap();
        let mut data: Vec<f32> = Vec::new();
        // Head 0: the layer itself; head 1: the same, so the mean is unchanged.
        for _ in 0..2 {
            for row in &rows {
                data.extend(row.iter().map(|&v| v as f32));
            }
        }
        let tensor = Tensor::from_vec(data, (1, 2, 3, 3), &Device::Cpu).unwrap();
        cache.push(tensor).unwrap();
    }

    let config = AttributionConfig::from_json(&serde_json::json!({
        "target_position": -1,
        "top_k": 2,
        "heatmap_scale": "linear",
    }))
    .unwrap();
    let propagator = AttributionPropagator::new(cache.layer_matrices().unwrap(), labels(3))
        .unwrap()
        .with_config(&config);
    let result = propagator.compute(config.target).unwrap();

    // f32 storage limits precision.
    for (a, e) in result.final_attribution.iter().zip([0.679, 0.241, 0.08]) {
        assert!((a - e).abs() < 1e-6);
    }
    assert_eq!(result.final_top_contributors.len(), 2);

    let json = result.to_json();
    assert_eq!(json["target_position"], 2);
    assert_eq!(json["layer_trace"].as_array().unwrap().len(), 3);

    let grid = HeatmapGrid::from_trace(&result, propagator.tokens(), HeatmapScale::Linear, 20);
    assert_eq!(grid.cells.len(), 3);
    assert!((grid.cells[0][0] - 0.802).abs() < 1e-6);
}

#[test]
fn head_tensors_are_averaged() {
    // Head 0 attends to itself, head 1 to position 0.
    #[rustfmt::skip]
    let data: Vec<f64> = vec![
        1.0, 0.0,
        0.0, 1.0,
        1.0, 0.0,
        1.0, 0.0,
    ];
    let tensor = Tensor::from_vec(data, (2, 2, 2), &Device::Cpu).unwrap();
    let propagator = AttributionPropagator::from_head_tensors(&[tensor], labels(2)).unwrap();
    let result = propagator.compute(TargetPosition::LAST).unwrap();
    assert_close(&result.final_attribution, &[0.5, 0.5]);

    let bad = Tensor::zeros((2, 3), DType::F64, &Device::Cpu).unwrap();
    assert!(matches!(
        AttributionPropagator::from_head_tensors(&[bad], labels(2)),
        Err(AttributionError::ShapeMismatch(_))
    ));
}
