// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ranking positions by attribution score.

use std::fmt;

/// A token position with its attribution (or attention) score.
#[derive(Debug, Clone, PartialEq)]
pub struct Contributor {
    /// Token label at this position.
    pub token: String,
    /// Attribution score.
    pub score: f64,
    /// Position in the sequence (0-indexed).
    pub position: usize,
}

impl fmt::Display for Contributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\" (pos {}): {:.6}",
            format_token(&self.token),
            self.position,
            self.score
        )
    }
}

/// The `k` highest-scoring positions, sorted by descending score.
///
/// Ties keep their original order, so the lower position comes first.
/// Positions without a label (more scores than tokens) get an empty label.
///
/// # Example
///
/// ```
/// use attn_attrib::attribution::contributors::top_contributors;
///
/// let tokens = vec!["<s>".to_string(), "a".into(), "b".into()];
/// let top = top_contributors(&[0.2, 0.5, 0.5], &tokens, 2);
/// assert_eq!(top[0].position, 1);
/// assert_eq!(top[1].position, 2);
/// ```
#[must_use]
pub fn top_contributors(scores: &[f64], tokens: &[String], k: usize) -> Vec<Contributor> {
    ranked_positions(scores, k)
        .into_iter()
        .map(|(position, score)| Contributor {
            token: tokens.get(position).cloned().unwrap_or_default(),
            score,
            position,
        })
        .collect()
}

/// Up to `k` `(position, score)` pairs by descending score, ties by position.
#[must_use]
pub fn ranked_positions(scores: &[f64], k: usize) -> Vec<(usize, f64)> {
    let mut indexed: Vec<(usize, f64)> = scores.iter().copied().enumerate().collect();
    // Stable sort: equal scores keep ascending position order.
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
}

/// Format a token for display, escaping whitespace characters.
#[must_use]
pub fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{i}")).collect()
    }

    #[test]
    fn sorted_descending() {
        let top = top_contributors(&[0.1, 0.7, 0.2], &labels(3), 3);
        let positions: Vec<usize> = top.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![1, 2, 0]);
        assert_eq!(top[0].token, "t1");
    }

    #[test]
    fn ties_prefer_lower_position() {
        let top = top_contributors(&[0.25, 0.25, 0.25, 0.25], &labels(4), 4);
        let positions: Vec<usize> = top.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[test]
    fn k_larger_than_sequence() {
        assert_eq!(top_contributors(&[0.5, 0.5], &labels(2), 10).len(), 2);
    }

    #[test]
    fn k_zero() {
        assert!(top_contributors(&[0.5, 0.5], &labels(2), 0).is_empty());
    }

    #[test]
    fn missing_labels_are_empty() {
        let top = top_contributors(&[0.1, 0.9], &labels(1), 1);
        assert_eq!(top[0].position, 1);
        assert!(top[0].token.is_empty());
    }

    #[test]
    fn format_token_escapes() {
        assert_eq!(format_token("a\nb"), "a\\nb");
        assert_eq!(format_token("\tx"), "\\tx");
        assert_eq!(format_token("plain"), "plain");
    }

    #[test]
    fn display_contributor() {
        let c = Contributor {
            token: "Tree".into(),
            score: 0.5,
            position: 3,
        };
        assert_eq!(c.to_string(), "\"Tree\" (pos 3): 0.500000");
    }
}
