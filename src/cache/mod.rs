// SPDX-License-Identifier: MIT OR Apache-2.0

//! Captured attention patterns.
//!
//! - [`AttentionCache`]: per-layer post-softmax attention patterns, read
//!   back as head-averaged matrices.

mod attention;

pub use attention::AttentionCache;
