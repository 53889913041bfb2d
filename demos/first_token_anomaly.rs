// SPDX-License-Identifier: MIT OR Apache-2.0

//! First-token anomaly: how much attention sinks into position 0.
//!
//! ```bash
//! cargo run --example first_token_anomaly
//! ```
//!
//! Builds synthetic causal attention with a first-token sink, then reports
//! per-layer entropy and first-token strength, the first-token share of the
//! last query, the clean (sink-free) attention, how attention to the
//! prompt evolves while tokens are generated, and the first-token ratio of
//! every generation step.

use attn_attrib::attribution::stats::{
    distribution_stats, exclude_first_token, first_token_share_by_layer,
};
use attn_attrib::util::masks::causal_softmax;
use attn_attrib::{AttentionEvolution, FirstTokenTrace, HeatmapScale, LayerAttentionMatrix};
use candle_core::{Device, Tensor};

const N_LAYERS: usize = 3;
const N_HEADS: usize = 2;

fn main() -> attn_attrib::Result<()> {
    tracing_subscriber::fmt::init();

    let prompt: Vec<String> = ["<s>", "Once", "upon", "a", "time"]
        .iter()
        .map(|t| (*t).to_string())
        .collect();
    let layers = build_layers(prompt.len())?;
    let last = prompt.len() - 1;

    // 1. Distribution statistics
    println!("=== Distribution statistics ===");
    for stats in distribution_stats(&layers)? {
        println!(
            "layer {}: mean entropy {:.4}, mean first-token strength {:.4}",
            stats.layer,
            stats.mean_entropy(),
            stats.mean_first_token_strength()
        );
    }

    // 2. First-token share of the last query
    println!("\n=== First-token share (query {last}) ===");
    for (layer, share) in first_token_share_by_layer(&layers, last)?.iter().enumerate() {
        println!(
            "layer {layer}: {:.4} of {:.4} ({:.1}%)",
            share.attention,
            share.total,
            share.ratio * 100.0
        );
    }

    // 3. Attention with the sink removed
    if let Some(final_layer) = layers.last() {
        let clean = exclude_first_token(&final_layer.row(last)?);
        println!("\n=== Clean attention (last layer) ===");
        for (position, weight) in clean.top(3) {
            let token = prompt.get(position).map_or("", String::as_str);
            println!("  \"{token}\" (pos {position}): {weight:.4}");
        }
    }

    // 4. Attention to the prompt during generation
    let mut evolution = AttentionEvolution::new(prompt.clone());
    let mut trace = FirstTokenTrace::new();
    for step in 1..=4 {
        let generated = build_layers(prompt.len() + step)?;
        if let Some(final_layer) = generated.last() {
            evolution.push_step(&final_layer.row(prompt.len() + step - 1)?)?;
        }
        trace.record(&generated)?;
    }
    println!("\n=== Generation dynamics ({} steps) ===", evolution.n_steps());
    for d in evolution.most_dynamic(3)? {
        println!(
            "  \"{}\": max {:.4}, min {:.4}, var {:.6}, final {:.4}",
            d.token, d.max, d.min, d.variance, d.final_value
        );
    }

    // 5. Spectrogram of the generation run
    let grid = evolution.to_grid(HeatmapScale::Log1p);
    println!("\n=== Spectrogram (log1p, {} x {}) ===", grid.steps.len(), grid.tokens.len());
    println!("{}", grid.to_json());

    // 6. First-token ratio per step
    println!("\n=== First-token ratio across steps ===");
    for (step, ratio) in trace.last_layer_ratios().iter().enumerate() {
        println!("  step {}: {:.1}%", step + 1, ratio * 100.0);
    }
    if let (Some(avg), Some(max)) = (trace.mean_last_layer_ratio(), trace.max_last_layer_ratio()) {
        println!("  last layer: mean {:.1}%, max {:.1}%", avg * 100.0, max * 100.0);
    }
    Ok(())
}

/// Head-averaged causal layers for a sequence of `seq_len` tokens.
fn build_layers(seq_len: usize) -> attn_attrib::Result<Vec<LayerAttentionMatrix>> {
    (0..N_LAYERS)
        .map(|layer| {
            let scores = Tensor::from_vec(
                sink_scores(layer, seq_len),
                (N_HEADS, seq_len, seq_len),
                &Device::Cpu,
            )?;
            LayerAttentionMatrix::from_head_tensor(&causal_softmax(&scores)?)
        })
        .collect()
}

/// Scores whose first-token bias grows with depth.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn sink_scores(layer: usize, seq_len: usize) -> Vec<f64> {
    let mut data = Vec::with_capacity(N_HEADS * seq_len * seq_len);
    for head in 0..N_HEADS {
        for q in 0..seq_len {
            for k in 0..seq_len {
                // CAST: small loop indices
                let sink = if k == 0 { 1.0 + layer as f64 } else { 0.0 };
                let content = ((q + 2 * k + head) % 4) as f64 * 0.3;
                data.push(sink + content);
            }
        }
    }
    data
}
