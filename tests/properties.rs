// SPDX-License-Identifier: MIT OR Apache-2.0

//! Property tests over random causal attention stacks.
//!
//! Run:
//!   `cargo test --test properties`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

use attn_attrib::attribution::l1_norm;
use attn_attrib::{AttributionPropagator, LayerAttentionMatrix, TargetPosition};
use proptest::prelude::*;

const TOL: f64 = 1e-9;

/// Build a causal layer from raw positive weights, scaling each row to sum
/// to `row_mass`.
fn causal_layer(raw: &[f64], n: usize, row_mass: f64) -> LayerAttentionMatrix {
    let rows: Vec<Vec<f64>> = (0..n)
        .map(|q| {
            let prefix = &raw[q * n..=q * n + q];
            let total: f64 = prefix.iter().sum();
            (0..n)
                .map(|k| if k <= q { raw[q * n + k] / total * row_mass } else { 0.0 })
                .collect()
        })
        .collect();
    LayerAttentionMatrix::from_rows(&rows).unwrap()
}

/// `(seq_len, raw weights per layer, target)` for 1..=6 tokens and 1..=4 layers.
fn arb_stack() -> impl Strategy<Value = (usize, Vec<Vec<f64>>, usize)> {
    (1usize..=6, 1usize..=4).prop_flat_map(|(n, n_layers)| {
        (
            Just(n),
            prop::collection::vec(prop::collection::vec(0.01f64..1.0, n * n), n_layers),
            0..n,
        )
    })
}

fn propagator(n: usize, raw: &[Vec<f64>], row_mass: f64) -> AttributionPropagator {
    let layers = raw.iter().map(|r| causal_layer(r, n, row_mass)).collect();
    let tokens = (0..n).map(|i| format!("t{i}")).collect();
    AttributionPropagator::new(layers, tokens).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Trace norms never exceed 1 and never grow as propagation proceeds.
    #[test]
    fn trace_norms_bounded_and_monotone((n, raw, target) in arb_stack(), mass in 0.5f64..=1.0) {
        let p = propagator(n, &raw, mass);
        let result = p.compute(TargetPosition::Index(target)).unwrap();
        let norms = result.trace_l1_norms();
        for &norm in &norms {
            prop_assert!(norm <= 1.0 + TOL);
        }
        // Trace is stored layer 0 first; propagation runs last layer first.
        for pair in norms.windows(2) {
            prop_assert!(pair[0] <= pair[1] + TOL);
        }
    }

    /// Composite rows sum to 1 for row-stochastic layers.
    #[test]
    fn composite_rows_sum_to_one((n, raw, _target) in arb_stack()) {
        let p = propagator(n, &raw, 1.0);
        let composite = p.composite_matrix().unwrap();
        for sum in composite.row_sums().unwrap() {
            prop_assert!((sum - 1.0).abs() < TOL);
        }
    }

    /// Composite rows never exceed 1 for sub-stochastic layers.
    #[test]
    fn composite_rows_bounded((n, raw, target) in arb_stack(), mass in 0.1f64..1.0) {
        let p = propagator(n, &raw, mass);
        let row = p.propagate_composite(TargetPosition::Index(target)).unwrap();
        prop_assert!(l1_norm(&row) <= 1.0 + TOL);
    }

    /// Causal layers never attribute to positions after the target.
    #[test]
    fn no_future_attribution((n, raw, target) in arb_stack()) {
        let p = propagator(n, &raw, 1.0);
        let result = p.compute(TargetPosition::Index(target)).unwrap();
        prop_assert!(result.final_attribution.iter().skip(target + 1).all(|&v| v == 0.0));
        for step in &result.layer_trace {
            prop_assert!(step.vector.iter().skip(target + 1).all(|&v| v == 0.0));
        }
    }

    /// Identical inputs give bit-identical outputs.
    #[test]
    fn idempotent((n, raw, target) in arb_stack()) {
        let first = propagator(n, &raw, 1.0).compute(TargetPosition::Index(target)).unwrap();
        let second = propagator(n, &raw, 1.0).compute(TargetPosition::Index(target)).unwrap();
        prop_assert_eq!(first.final_attribution, second.final_attribution);
        for (a, b) in first.layer_trace.iter().zip(&second.layer_trace) {
            prop_assert_eq!(&a.vector, &b.vector);
        }
        prop_assert_eq!(first.final_top_contributors, second.final_top_contributors);
    }
}
