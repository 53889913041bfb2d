// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attribution walkthrough: capture attention, propagate, report.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example attribution_walkthrough
//! ```
//!
//! Builds synthetic causal attention for a short sentence (a strong
//! first-token sink plus a recency bias), runs both attribution methods for
//! the last three tokens and prints the summaries, a token heatmap and a
//! JSON report.

use attn_attrib::{
    AttentionCache, AttributionConfig, AttributionPropagator, HeatmapGrid, token_heatmap,
};
use candle_core::{Device, Tensor};
use tracing_subscriber::EnvFilter;

const N_LAYERS: usize = 4;
const N_HEADS: usize = 4;

fn main() -> attn_attrib::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let tokens: Vec<String> = ["<s>", "The", "cat", "sat", "on", "the", "mat"]
        .iter()
        .map(|t| (*t).to_string())
        .collect();
    let seq_len = tokens.len();

    // 1. Capture: one [1, heads, seq, seq] pattern per layer
    let mut cache = AttentionCache::with_capacity(N_LAYERS);
    for layer in 0..N_LAYERS {
        let scores = Tensor::from_vec(
            synthetic_scores(layer, seq_len),
            (1, N_HEADS, seq_len, seq_len),
            &Device::Cpu,
        )?;
        cache.push(attn_attrib::util::masks::causal_softmax(&scores)?)?;
    }
    println!(
        "Captured {} layers; last token attends most to {:?} in layer 0",
        cache.n_layers(),
        cache.top_attended_positions(0, seq_len - 1, 3)?
    );

    // 2. Configure
    let config = AttributionConfig::from_json(&serde_json::json!({
        "top_k": 5,
        "layer_top_k": 3,
        "reduction": "weighted_layers",
        "heatmap_scale": "log1p"
    }))?;

    // 3. Propagate
    let layers = cache.layer_matrices()?;
    let propagator = AttributionPropagator::new(layers, tokens.clone())?.with_config(&config);
    let analysis = propagator.analyze_positions(&propagator.default_targets())?;
    analysis.print_summary();

    // 4. Layer-by-layer trace for the configured target
    let result = propagator.compute(config.target)?;
    println!("\nTrace for \"{}\":", result.target_token);
    for (step, norm) in result.layer_trace.iter().zip(result.trace_l1_norms()) {
        let top: Vec<String> = step
            .top_contributors
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("  layer {} (L1 {norm:.4}): {}", step.layer, top.join(", "));
    }

    // 5. Heatmaps
    let heatmap = token_heatmap(propagator.layers(), &tokens, config.reduction)?;
    println!("\nIncoming attention ({}):", heatmap.policy);
    for entry in heatmap.top(3) {
        println!("  {} = {:.4}", entry.key(), entry.weight);
    }
    for (concept, weight) in heatmap.map_to_concepts(&["cat", "mat", "dog"]) {
        println!("  concept {concept} = {weight:.4}");
    }
    let grid = HeatmapGrid::from_trace(
        &result,
        &tokens,
        config.heatmap_scale,
        config.heatmap_max_tokens,
    );
    println!("\nHeatmap grid:\n{:#}", grid.to_json());

    // 6. Full report
    println!("\nReport:\n{:#}", result.to_json());
    Ok(())
}

/// Deterministic pre-softmax scores, flattened as `[heads, seq, seq]`.
///
/// Every head favours position 0; heads differ in how strongly they favour
/// recent tokens.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn synthetic_scores(layer: usize, seq_len: usize) -> Vec<f64> {
    let mut data = Vec::with_capacity(N_HEADS * seq_len * seq_len);
    for head in 0..N_HEADS {
        // CAST: small loop indices
        let recency = 0.4 * (head + 1) as f64 / (layer + 1) as f64;
        for q in 0..seq_len {
            for k in 0..seq_len {
                let sink = if k == 0 { 2.5 } else { 0.0 };
                let distance = q.abs_diff(k) as f64;
                let jitter = ((q * 7 + k * 3 + head + layer) % 5) as f64 * 0.1;
                data.push(sink - recency * distance + jitter);
            }
        }
    }
    data
}
