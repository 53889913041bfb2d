// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: causal attention masks.

pub mod masks;
