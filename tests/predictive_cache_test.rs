//! Tests for [`PredictiveCache`]: fuzzy lookups, pattern learning and prefetching.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use thrifty::clock::{Clock, ManualClock};
use thrifty::{
    CompletionRequest, CompletionResponse, Message, PredictiveCache, PredictiveConfig, Result,
    SimilarityConfig, ThriftyError, UpstreamExecutor,
};

// ============================================================================
// Mock executors
// ============================================================================

struct CountingExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl UpstreamExecutor for CountingExecutor {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CompletionResponse::text(format!(
            "prefetched: {}",
            request.conversation_text()
        )))
    }
}

struct FailingExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl UpstreamExecutor for FailingExecutor {
    async fn execute(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ThriftyError::Upstream("connection reset".into()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn req(model: &str, texts: &[&str]) -> CompletionRequest {
    CompletionRequest::new(model, texts.iter().map(|t| Message::user(*t)).collect())
}

fn cache_with(config: PredictiveConfig) -> (PredictiveCache, Arc<ManualClock>) {
    let clock = ManualClock::shared();
    let cache = PredictiveCache::new(config, SimilarityConfig::default(), clock.clone());
    (cache, clock)
}

/// Config that prefetches any variation of a pattern seen three times, and
/// only fuzzy-matches near-identical requests.
fn eager_prefetch() -> PredictiveConfig {
    PredictiveConfig::new()
        .similarity_threshold(0.99)
        .prefetch_confidence(0.3)
        .min_pattern_frequency(3)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// =========================================================================
// Lookups
// =========================================================================

#[test]
fn exact_set_then_get_has_full_confidence() {
    let (cache, _) = cache_with(PredictiveConfig::default());
    let r = req("m1", &["ping"]);
    cache.set(&r, CompletionResponse::text("pong"));

    let hit = cache.get(&r).expect("exact hit");
    assert_eq!(hit.response.content, "pong");
    assert_eq!(hit.confidence, 1.0);
    assert!(!hit.prefetched);
    assert_eq!(cache.stats().exact_hits, 1);
}

#[test]
fn similarity_at_threshold_is_a_hit() {
    let (cache, _) = cache_with(PredictiveConfig::default());
    cache.set(&req("m1", &["hello world"]), CompletionResponse::text("hi"));

    // Same model and text, different message count: 0.3 + 0.5 = 0.8.
    let hit = cache.get(&req("m1", &["hello", "world"])).expect("fuzzy hit");
    assert_eq!(hit.confidence, 0.8);
    assert_eq!(hit.response.content, "hi");
    assert_eq!(cache.stats().fuzzy_hits, 1);
}

#[test]
fn exact_and_fuzzy_hits_both_touch_the_entry() {
    let (cache, clock) = cache_with(PredictiveConfig::default());
    let stored = req("m1", &["hello world"]);
    cache.set(&stored, CompletionResponse::text("hi"));
    let stored_at = clock.now();
    assert_eq!(cache.access(&stored).unwrap().count, 1);

    clock.advance(Duration::from_secs(60));
    cache.get(&stored).expect("exact hit");
    let access = cache.access(&stored).unwrap();
    assert_eq!(access.count, 2);
    assert_eq!(access.last_access, stored_at + Duration::from_secs(60));

    clock.advance(Duration::from_secs(60));
    cache.get(&req("m1", &["hello", "world"])).expect("fuzzy hit");
    let access = cache.access(&stored).unwrap();
    assert_eq!(access.count, 3);
    assert_eq!(access.last_access, stored_at + Duration::from_secs(120));

    assert!(cache.get(&req("m2", &["unrelated"])).is_none());
    assert_eq!(cache.stats().total_accesses, 3);
    assert!(cache.access(&req("m1", &["hello", "world"])).is_none());
}

#[test]
fn similarity_below_threshold_is_a_miss() {
    let (cache, _) = cache_with(PredictiveConfig::default());
    cache.set(&req("m1", &["hello world"]), CompletionResponse::text("hi"));

    // Different model, same count and text: 0.2 + 0.5 = 0.7.
    assert!(cache.get(&req("m2", &["hello world"])).is_none());
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn best_match_wins() {
    let (cache, _) = cache_with(PredictiveConfig::new().similarity_threshold(0.5));
    cache.set(&req("m1", &["alpha beta gamma"]), CompletionResponse::text("close"));
    cache.set(&req("m1", &["alpha zeta eta"]), CompletionResponse::text("far"));

    let hit = cache.get(&req("m1", &["alpha beta delta"])).expect("fuzzy hit");
    assert_eq!(hit.response.content, "close");
    assert!(hit.confidence < 1.0);
}

#[test]
fn expired_entries_are_not_matched() {
    let (cache, clock) = cache_with(PredictiveConfig::default());
    let r = req("m1", &["ping"]);
    cache.set(&r, CompletionResponse::text("pong"));
    clock.advance(Duration::from_secs(601));

    assert!(cache.get(&r).is_none());
    assert_eq!(cache.sweep(), 1);
    assert!(cache.is_empty());
}

// =========================================================================
// Pattern learning
// =========================================================================

#[test]
fn set_learns_patterns_by_signature() {
    let (cache, clock) = cache_with(PredictiveConfig::default());
    for text in ["question one", "question two", "question six"] {
        cache.set(&req("m1", &[text]), CompletionResponse::text("a"));
        clock.advance(Duration::from_secs(30));
    }

    let pattern = cache.pattern_for(&req("m1", &["question ten"])).expect("pattern");
    assert_eq!(pattern.frequency, 3);
    assert_eq!(pattern.variations.len(), 3);
    assert_eq!(pattern.base_request.messages[0].text(), "question one");
    assert_eq!(cache.stats().learned_patterns, 1);
}

#[test]
fn sweep_drops_idle_rare_patterns_only() {
    let (cache, clock) = cache_with(PredictiveConfig::default());
    cache.set(&req("m1", &["rare"]), CompletionResponse::text("a"));
    for _ in 0..5 {
        cache.set(&req("m1", &["common request"]), CompletionResponse::text("b"));
    }
    clock.advance(Duration::from_secs(25 * 3600));

    cache.sweep();

    assert!(cache.pattern_for(&req("m1", &["rare"])).is_none());
    assert!(cache.pattern_for(&req("m1", &["common request"])).is_some());
}

#[test]
fn prediction_drops_tasks_when_queue_is_full() {
    // No runtime: the prediction pass triggered by `set` runs inline.
    let (cache, _) = cache_with(eager_prefetch().queue_capacity(1));
    for text in ["question one", "question two", "question six"] {
        cache.set(&req("m1", &[text]), CompletionResponse::text("a"));
    }

    assert_eq!(cache.stats().prefetch_queue_size, 1);
    assert_eq!(cache.predict_next(&req("m1", &["question six"])), 0);
}

#[test]
fn rare_patterns_do_not_predict() {
    let (cache, _) = cache_with(eager_prefetch());
    cache.set(&req("m1", &["question one"]), CompletionResponse::text("a"));
    cache.set(&req("m1", &["question two"]), CompletionResponse::text("a"));

    assert_eq!(cache.predict_next(&req("m1", &["question two"])), 0);
    assert_eq!(cache.stats().prefetch_queue_size, 0);
}

// =========================================================================
// Prefetching
// =========================================================================

#[tokio::test]
async fn prefetcher_fills_uncached_variations() {
    let (cache, clock) = cache_with(eager_prefetch());
    let executor = Arc::new(CountingExecutor {
        calls: AtomicU32::new(0),
    });
    let worker = cache.start_prefetcher(executor.clone()).expect("first start");
    assert!(cache.start_prefetcher(executor.clone()).is_none());

    let first = req("m1", &["question one"]);
    cache.set(&first, CompletionResponse::text("organic"));
    // Let the organic entry for `first` expire so it is worth prefetching.
    clock.advance(Duration::from_secs(601));
    cache.set(&req("m1", &["question two"]), CompletionResponse::text("organic"));
    cache.set(&req("m1", &["question six"]), CompletionResponse::text("organic"));

    wait_until(|| cache.stats().prefetch_entries == 1).await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    let hit = cache.get(&first).expect("prefetched entry");
    assert!(hit.prefetched);
    assert_eq!(hit.response.content, "prefetched: question one");
    assert!(cache.stats().avg_prefetch_confidence > 0.3);

    worker.abort();
}

#[tokio::test]
async fn prefetch_failures_are_swallowed() {
    let (cache, clock) = cache_with(eager_prefetch());
    let executor = Arc::new(FailingExecutor {
        calls: AtomicU32::new(0),
    });
    let worker = cache.start_prefetcher(executor.clone()).expect("start");

    cache.set(&req("m1", &["question one"]), CompletionResponse::text("a"));
    clock.advance(Duration::from_secs(601));
    cache.set(&req("m1", &["question two"]), CompletionResponse::text("a"));
    cache.set(&req("m1", &["question six"]), CompletionResponse::text("a"));

    let probe = req("m1", &["question ten"]);
    wait_until(|| {
        cache
            .pattern_for(&probe)
            .is_some_and(|p| p.success_rate < 1.0)
    })
    .await;

    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().prefetch_entries, 0);

    worker.abort();
}
