//! End-to-end tests for [`Optimizer`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use thrifty::clock::ManualClock;
use thrifty::{
    CompletionRequest, CompletionResponse, CompressorConfig, DedupConfig, Message, Optimizer,
    OptimizerBuilder, PredictiveConfig, Provenance, ResponseCacheConfig, Result, ThriftyError,
    UpstreamExecutor,
};

// ============================================================================
// Mock executors
// ============================================================================

/// Records every request it receives and answers with the last user text.
#[derive(Default)]
struct RecordingExecutor {
    calls: AtomicU32,
    seen: Mutex<Vec<CompletionRequest>>,
}

impl RecordingExecutor {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamExecutor for RecordingExecutor {
    fn name(&self) -> &str {
        "recording"
    }

    async fn execute(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(request.clone());
        Ok(CompletionResponse::text(format!(
            "answer {n}: {}",
            request.last_user_text().unwrap_or_default()
        )))
    }
}

/// Fails the first call, succeeds afterwards.
#[derive(Default)]
struct FlakyExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl UpstreamExecutor for FlakyExecutor {
    async fn execute(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ThriftyError::Upstream("connection reset".into()));
        }
        Ok(CompletionResponse::text("recovered"))
    }
}

/// Answers after a fixed delay on the Tokio clock.
struct SlowExecutor {
    delay: Duration,
    calls: AtomicU32,
}

impl SlowExecutor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl UpstreamExecutor for SlowExecutor {
    async fn execute(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(CompletionResponse::text(format!(
            "slow: {}",
            request.last_user_text().unwrap_or_default()
        )))
    }
}

/// Never completes.
struct HangingExecutor;

#[async_trait]
impl UpstreamExecutor for HangingExecutor {
    async fn execute(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
        std::future::pending().await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn req(text: &str) -> CompletionRequest {
    CompletionRequest::new("m1", vec![Message::user(text)])
}

fn builder(executor: Arc<dyn UpstreamExecutor>, clock: &Arc<ManualClock>) -> OptimizerBuilder {
    Optimizer::builder(executor).clock(clock.clone())
}

/// Let spawned cache write-backs run.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// =========================================================================
// Scenarios
// =========================================================================

#[tokio::test]
async fn repeated_request_is_served_recent_then_from_cache() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock)
        .predictive(PredictiveConfig::new().enabled(false))
        .build()
        .unwrap();

    let first = optimizer.process(req("ping")).await.unwrap();
    assert_eq!(first.provenance, Provenance::Upstream);
    assert_eq!(first.response.content, "answer 1: ping");

    // No yield in between: the cache write-back has not run yet.
    let second = optimizer.process(req("ping")).await.unwrap();
    assert_eq!(second.provenance, Provenance::Recent);
    assert_eq!(second.response, first.response);

    settle().await;
    clock.advance(Duration::from_secs(3 * 60));

    let third = optimizer.process(req("ping")).await.unwrap();
    assert_eq!(third.provenance, Provenance::ExactHit);
    assert_eq!(third.response, first.response);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn near_identical_request_gets_the_merged_response() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock)
        .predictive(PredictiveConfig::new().enabled(false))
        .build()
        .unwrap();

    let prefix = "what is the idiomatic way to share a hash map between several tokio tasks \
                  that mostly read from it at runtime";
    let first = optimizer
        .process(req(&format!("{prefix} concurrently")))
        .await
        .unwrap();
    let second = optimizer
        .process(req(&format!("{prefix} simultaneously")))
        .await
        .unwrap();

    assert_eq!(second.provenance, Provenance::Merged);
    assert_eq!(second.response, first.response);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn predictive_tier_answers_exact_and_similar_repeats() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock).build().unwrap();

    let first = optimizer.process(req("hello world")).await.unwrap();
    assert_eq!(first.provenance, Provenance::Upstream);
    settle().await;

    let exact = optimizer.process(req("hello world")).await.unwrap();
    assert_eq!(exact.provenance, Provenance::PredictiveHit { confidence: 1.0 });

    let similar = CompletionRequest::new("m1", vec![Message::user("hello"), Message::user("world")]);
    let fuzzy = optimizer.process(similar).await.unwrap();
    assert_eq!(fuzzy.provenance, Provenance::PredictiveHit { confidence: 0.8 });
    assert_eq!(fuzzy.response, first.response);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn long_conversations_are_compressed_before_execution() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock)
        .compressor(CompressorConfig::new().max_context_length(1_000))
        .build()
        .unwrap();

    let request = CompletionRequest::new(
        "m1",
        vec![
            Message::system("be brief"),
            Message::user("a".repeat(400)),
            Message::assistant("cache eviction ".repeat(27)),
            Message::user("cache policy ".repeat(31)),
            Message::assistant("d".repeat(400)),
            Message::user("final question?"),
            Message::assistant("ok"),
        ],
    );
    optimizer.process(request.clone()).await.unwrap();

    let seen = executor.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].messages.len(), 6);
    assert!(seen[0].messages[2].text().starts_with("[Summary: "));
    assert!(optimizer.compressor().cached_context(&request.messages).is_some());
}

// =========================================================================
// Bypass and failure paths
// =========================================================================

#[tokio::test]
async fn streaming_requests_pass_straight_through() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock).build().unwrap();

    for _ in 0..2 {
        let served = optimizer.process(req("ping").streaming(true)).await.unwrap();
        assert_eq!(served.provenance, Provenance::Passthrough);
        assert!(!served.provenance.is_hit());
    }
    settle().await;

    assert_eq!(executor.calls(), 2);
    let stats = optimizer.stats();
    assert_eq!(stats.response_cache.cache_size, 0);
    assert_eq!(stats.predictive.total_cache_entries, 0);
    assert_eq!(stats.dedup.executions, 0);
}

#[tokio::test]
async fn empty_requests_are_rejected() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock).build().unwrap();

    let err = optimizer
        .process(CompletionRequest::new("m1", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, ThriftyError::InvalidInput(_)));
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn upstream_errors_are_returned_and_not_cached() {
    let executor = Arc::new(FlakyExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock).build().unwrap();

    let err = optimizer.process(req("ping")).await.unwrap_err();
    assert_eq!(err, ThriftyError::Upstream("connection reset".into()));
    settle().await;

    let retry = optimizer.process(req("ping")).await.unwrap();
    assert_eq!(retry.provenance, Provenance::Upstream);
    assert_eq!(retry.response.content, "recovered");
}

#[tokio::test]
async fn disabled_dedup_executes_directly_and_still_caches() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock)
        .dedup(DedupConfig::new().enabled(false))
        .predictive(PredictiveConfig::new().enabled(false))
        .build()
        .unwrap();

    let first = optimizer.process(req("ping")).await.unwrap();
    assert_eq!(first.provenance, Provenance::Upstream);
    settle().await;

    let second = optimizer.process(req("ping")).await.unwrap();
    assert_eq!(second.provenance, Provenance::ExactHit);
    assert_eq!(executor.calls(), 1);
    assert_eq!(optimizer.stats().dedup.executions, 0);
}

#[tokio::test(start_paused = true)]
async fn handler_timeout_bounds_the_wait() {
    let clock = ManualClock::shared();
    let config = thrifty::OptimizerConfig::new().handler_timeout(Duration::from_secs(5));
    let optimizer = builder(Arc::new(HangingExecutor), &clock)
        .config(config)
        .build()
        .unwrap();

    let err = optimizer.process(req("ping")).await.unwrap_err();
    assert_eq!(err, ThriftyError::Timeout(Duration::from_secs(5)));
    assert!(optimizer.deduplicator().is_active(&req("ping")));
}

#[tokio::test(start_paused = true)]
async fn result_is_cached_after_the_caller_times_out() {
    let executor = Arc::new(SlowExecutor::new(Duration::from_secs(50)));
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock)
        .config(thrifty::OptimizerConfig::new().handler_timeout(Duration::from_secs(45)))
        .build()
        .unwrap();

    let err = optimizer.process(req("ping")).await.unwrap_err();
    assert_eq!(err, ThriftyError::Timeout(Duration::from_secs(45)));
    assert!(!optimizer.response_cache().contains(&req("ping")));

    // The execution finishes at 50s, after its caller left.
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;

    assert!(optimizer.response_cache().contains(&req("ping")));
    assert_eq!(optimizer.predictive_cache().len(), 1);
    assert!(optimizer.predictive_cache().pattern_for(&req("ping")).is_some());

    clock.advance(Duration::from_secs(3 * 60));
    let again = optimizer.process(req("ping")).await.unwrap();
    assert_eq!(again.provenance, Provenance::PredictiveHit { confidence: 1.0 });
    assert_eq!(again.response.content, "slow: ping");
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn result_is_cached_after_the_caller_is_dropped() {
    let executor = Arc::new(SlowExecutor::new(Duration::from_secs(20)));
    let clock = ManualClock::shared();
    let optimizer = Arc::new(builder(executor.clone(), &clock).build().unwrap());

    let caller = tokio::spawn({
        let optimizer = Arc::clone(&optimizer);
        async move { optimizer.process(req("ping")).await }
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(optimizer.deduplicator().is_active(&req("ping")));
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;

    assert!(optimizer.response_cache().contains(&req("ping")));
    assert_eq!(optimizer.predictive_cache().len(), 1);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn direct_execution_is_cached_after_the_caller_times_out() {
    let executor = Arc::new(SlowExecutor::new(Duration::from_secs(10)));
    let clock = ManualClock::shared();
    let optimizer = builder(executor.clone(), &clock)
        .config(thrifty::OptimizerConfig::new().handler_timeout(Duration::from_secs(5)))
        .dedup(DedupConfig::new().enabled(false))
        .build()
        .unwrap();

    let err = optimizer.process(req("ping")).await.unwrap_err();
    assert_eq!(err, ThriftyError::Timeout(Duration::from_secs(5)));

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert!(optimizer.response_cache().contains(&req("ping")));
}

// =========================================================================
// Lifecycle and maintenance
// =========================================================================

#[tokio::test]
async fn start_is_idempotent_and_shutdown_stops_background_work() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor, &clock).build().unwrap();

    assert!(!optimizer.is_running());
    optimizer.start();
    optimizer.start();
    assert!(optimizer.is_running());

    optimizer.shutdown();
    assert!(!optimizer.is_running());
}

#[tokio::test]
async fn run_sweeps_reports_removals_per_component() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor, &clock).build().unwrap();

    optimizer.process(req("ping")).await.unwrap();
    settle().await;

    assert_eq!(optimizer.run_sweeps().total(), 0);

    clock.advance(Duration::from_secs(31 * 60));
    let report = optimizer.run_sweeps();
    assert_eq!(report.response_cache, 1);
    assert_eq!(report.predictive, 1);
    assert_eq!(report.compressor, 0);
    assert_eq!(report.dedup, 2);
    assert_eq!(report.total(), 4);
}

#[tokio::test]
async fn stats_serialize_per_component() {
    let executor = Arc::new(RecordingExecutor::default());
    let clock = ManualClock::shared();
    let optimizer = builder(executor, &clock).build().unwrap();
    optimizer.process(req("ping")).await.unwrap();
    settle().await;

    let json = serde_json::to_value(optimizer.stats()).unwrap();
    assert_eq!(json["response_cache"]["cache_size"], 1);
    assert_eq!(json["predictive"]["total_cache_entries"], 1);
    assert_eq!(json["dedup"]["executions"], 1);
    assert_eq!(json["compressor"]["max_context_length"], 4_000);
}

#[test]
fn builder_rejects_invalid_config() {
    let err = Optimizer::builder(Arc::new(HangingExecutor))
        .response_cache(ResponseCacheConfig::new().max_entries(0))
        .build()
        .err()
        .expect("config should be rejected");
    assert!(matches!(err, ThriftyError::Configuration(_)));

    let err = Optimizer::builder(Arc::new(HangingExecutor))
        .predictive(PredictiveConfig::new().prefetch_ttl(Duration::from_secs(60)))
        .build()
        .err()
        .expect("config should be rejected");
    assert!(matches!(err, ThriftyError::Configuration(_)));
}
