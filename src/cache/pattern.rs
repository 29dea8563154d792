//! Learned request patterns.
//!
//! A pattern groups requests sharing an abstract signature: model, message
//! count, whether the conversation opens with a system message, and the
//! average message length. Patterns that recur often enough drive
//! prefetching of their recorded variations.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use crate::types::CompletionRequest;

/// Time until the first predicted recurrence of a brand new pattern.
const INITIAL_PREDICTION_HORIZON: Duration = Duration::from_secs(3600);

/// Weight of the newest prefetch outcome in the running success rate.
const SUCCESS_RATE_ALPHA: f64 = 0.1;

/// Signature hash used to key patterns.
pub(crate) fn pattern_key(request: &CompletionRequest) -> u64 {
    let count = request.messages.len();
    let has_system = request.messages.first().is_some_and(|m| m.is_system());
    let avg_len = if count > 0 {
        request.total_chars() / count
    } else {
        0
    };

    let mut hasher = DefaultHasher::new();
    request.model.hash(&mut hasher);
    count.hash(&mut hasher);
    has_system.hash(&mut hasher);
    avg_len.hash(&mut hasher);
    hasher.finish()
}

/// A learned family of requests.
#[derive(Debug, Clone)]
pub struct RequestPattern {
    /// First request observed with this signature.
    pub base_request: CompletionRequest,
    /// Most recent requests with this signature, oldest first.
    pub variations: VecDeque<CompletionRequest>,
    /// Number of observations.
    pub frequency: u64,
    pub last_seen: Instant,
    /// Estimated time of the next occurrence.
    pub next_predicted: Instant,
    /// Running success rate of prefetches issued for this pattern, in [0, 1].
    pub success_rate: f64,
}

impl RequestPattern {
    pub(crate) fn new(request: CompletionRequest, now: Instant) -> Self {
        let mut variations = VecDeque::new();
        variations.push_back(request.clone());
        Self {
            base_request: request,
            variations,
            frequency: 1,
            last_seen: now,
            next_predicted: now + INITIAL_PREDICTION_HORIZON,
            success_rate: 1.0,
        }
    }

    /// Record another observation, keeping at most `max_variations`.
    pub(crate) fn observe(&mut self, request: CompletionRequest, now: Instant, max_variations: usize) {
        let gap = now.saturating_duration_since(self.last_seen);
        self.frequency += 1;
        self.last_seen = now;
        self.next_predicted = now + gap;
        self.variations.push_back(request);
        while self.variations.len() > max_variations {
            self.variations.pop_front();
        }
    }

    /// Fold a prefetch outcome into the success rate.
    pub(crate) fn record_outcome(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate =
            (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate + SUCCESS_RATE_ALPHA * outcome;
    }

    /// Hours since this pattern was last observed.
    pub(crate) fn hours_since_seen(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.last_seen).as_secs_f64() / 3600.0
    }
}
