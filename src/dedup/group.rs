//! Recent-result memos and mergeable request families.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use super::DedupConfig;
use crate::similarity::SimilarityConfig;
use crate::types::{CompletionRequest, CompletionResponse};

/// Short-lived memo of a just-completed exact request.
#[derive(Debug, Clone)]
pub(crate) struct RecentRequest {
    pub(crate) request: CompletionRequest,
    pub(crate) response: CompletionResponse,
    pub(crate) completed_at: Instant,
}

/// Family signature: model, message count and the leading `prefix_chars`
/// characters of the last user message.
pub(crate) fn family_key(request: &CompletionRequest, prefix_chars: usize) -> u64 {
    let last_user: String = request
        .last_user_text()
        .unwrap_or_default()
        .chars()
        .take(prefix_chars)
        .collect();

    let mut hasher = DefaultHasher::new();
    request.model.hash(&mut hasher);
    request.messages.len().hash(&mut hasher);
    last_user.hash(&mut hasher);
    hasher.finish()
}

/// A family of similar, not identical, completed requests sharing one
/// cached response.
#[derive(Debug, Clone)]
pub struct MergeableGroup {
    pub base_request: CompletionRequest,
    /// Most recent members, oldest first.
    pub variations: VecDeque<CompletionRequest>,
    pub last_merged: Instant,
    /// Number of requests folded into this group, the first included.
    pub merge_count: u64,
    /// Response of the most recent successful execution in the family.
    pub response: CompletionResponse,
}

impl MergeableGroup {
    pub(crate) fn new(request: CompletionRequest, response: CompletionResponse, now: Instant) -> Self {
        let mut variations = VecDeque::new();
        variations.push_back(request.clone());
        Self {
            base_request: request,
            variations,
            last_merged: now,
            merge_count: 1,
            response,
        }
    }

    /// Whether `request` may be answered with this group's response.
    pub(crate) fn can_merge(
        &self,
        request: &CompletionRequest,
        now: Instant,
        config: &DedupConfig,
        similarity: &SimilarityConfig,
    ) -> bool {
        if request.model != self.base_request.model {
            return false;
        }
        if request
            .messages
            .len()
            .abs_diff(self.base_request.messages.len())
            > config.max_message_count_diff
        {
            return false;
        }
        if now.saturating_duration_since(self.last_merged) >= config.merge_window {
            return false;
        }

        let ours = self.base_request.last_user_text().unwrap_or_default();
        let theirs = request.last_user_text().unwrap_or_default();
        similarity.text_similarity(&ours, &theirs) > config.merge_similarity
    }

    /// Fold `request` into the group.
    pub(crate) fn merge(&mut self, request: CompletionRequest, now: Instant, max_variations: usize) {
        self.variations.push_back(request);
        while self.variations.len() > max_variations {
            self.variations.pop_front();
        }
        self.merge_count += 1;
        self.last_merged = now;
    }

    /// Replace the cached response after a fresh execution in this family.
    pub(crate) fn refresh(&mut self, response: CompletionResponse, now: Instant) {
        self.response = response;
        self.last_merged = now;
    }
}
