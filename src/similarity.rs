//! Similarity kernel.
//!
//! Pure functions shared by the predictive cache (fuzzy lookup, prediction
//! confidence) and the deduplicator (group compatibility). Lengths and edit
//! distances are measured in `char`s, so multi-byte text is compared per
//! character rather than per byte.

use std::collections::HashSet;

use crate::types::CompletionRequest;

/// Default input cap for [`edit_distance`], in characters.
pub const DEFAULT_MAX_EDIT_LEN: usize = 500;

/// Weights and bounds for the similarity kernel.
///
/// ```rust
/// # use thrifty::SimilarityConfig;
/// let config = SimilarityConfig::new().max_edit_len(200).content_weight(0.6);
/// assert_eq!(config.max_edit_len, 200);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityConfig {
    /// Inputs longer than this are truncated before edit distance. Default: 500.
    pub max_edit_len: usize,
    /// Weight of the binary model match. Default: 0.3.
    pub model_weight: f64,
    /// Weight of the binary message-count match. Default: 0.2.
    pub message_count_weight: f64,
    /// Weight of the Jaccard content similarity. Default: 0.5.
    pub content_weight: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            max_edit_len: DEFAULT_MAX_EDIT_LEN,
            model_weight: 0.3,
            message_count_weight: 0.2,
            content_weight: 0.5,
        }
    }
}

impl SimilarityConfig {
    /// Create a config with the default weights.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the edit distance input cap.
    pub fn max_edit_len(mut self, n: usize) -> Self {
        self.max_edit_len = n;
        self
    }

    /// Set the model match weight.
    pub fn model_weight(mut self, w: f64) -> Self {
        self.model_weight = w;
        self
    }

    /// Set the message-count match weight.
    pub fn message_count_weight(mut self, w: f64) -> Self {
        self.message_count_weight = w;
        self
    }

    /// Set the content similarity weight.
    pub fn content_weight(mut self, w: f64) -> Self {
        self.content_weight = w;
        self
    }

    fn total_weight(&self) -> f64 {
        self.model_weight + self.message_count_weight + self.content_weight
    }

    /// Levenshtein distance with this config's input cap.
    pub fn edit_distance(&self, a: &str, b: &str) -> usize {
        let a: Vec<char> = a.chars().take(self.max_edit_len).collect();
        let b: Vec<char> = b.chars().take(self.max_edit_len).collect();
        levenshtein(&a, &b)
    }

    /// `1 - distance / max_len`, with 1.0 for two empty strings and 0.0 when
    /// exactly one is empty.
    pub fn text_similarity(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let max_len = a.chars().count().max(b.chars().count());
        let distance = self.edit_distance(a, b);
        1.0 - distance as f64 / max_len as f64
    }

    /// Weighted blend of model match, message-count match and Jaccard
    /// similarity of the lowercased conversation text, normalised by the
    /// total weight.
    pub fn request_similarity(&self, r1: &CompletionRequest, r2: &CompletionRequest) -> f64 {
        let total = self.total_weight();
        if total <= 0.0 {
            return 0.0;
        }

        let mut score = 0.0;
        if r1.model == r2.model {
            score += self.model_weight;
        }
        if r1.messages.len() == r2.messages.len() {
            score += self.message_count_weight;
        }
        score += content_similarity(r1, r2) * self.content_weight;

        score / total
    }
}

/// Levenshtein distance, truncating inputs to [`DEFAULT_MAX_EDIT_LEN`] chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    SimilarityConfig::default().edit_distance(a, b)
}

/// Edit-distance similarity with the default input cap.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    SimilarityConfig::default().text_similarity(a, b)
}

/// Request similarity with the default weights.
pub fn request_similarity(r1: &CompletionRequest, r2: &CompletionRequest) -> f64 {
    SimilarityConfig::default().request_similarity(r1, r2)
}

/// Jaccard similarity over lowercased whitespace-separated token sets.
///
/// 1.0 when both inputs have no tokens, 0.0 when exactly one does.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    let set_a: HashSet<&str> = a_lower.split_whitespace().collect();
    let set_b: HashSet<&str> = b_lower.split_whitespace().collect();

    match (set_a.is_empty(), set_b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;
    intersection as f64 / union as f64
}

fn content_similarity(r1: &CompletionRequest, r2: &CompletionRequest) -> f64 {
    match (r1.messages.is_empty(), r2.messages.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        _ => jaccard_similarity(&r1.conversation_text(), &r2.conversation_text()),
    }
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
