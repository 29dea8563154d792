//! Similarity-driven predictive cache.
//!
//! [`PredictiveCache`] answers lookups by exact key first (confidence 1.0)
//! and otherwise by the most similar stored request, as long as its
//! [request similarity](crate::similarity) reaches the configured
//! threshold; the similarity becomes the match confidence.
//!
//! Every `set` also feeds a pattern learner (see [`RequestPattern`]) and
//! triggers a background prediction pass. Predicted requests are queued for
//! the prefetch worker, which executes them upstream and stores the results
//! as prefetch entries with a longer TTL than organic ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::pattern::{RequestPattern, pattern_key};
use super::prefetch::{self, PrefetchTask};
use crate::clock::SharedClock;
use crate::executor::UpstreamExecutor;
use crate::lock;
use crate::similarity::SimilarityConfig;
use crate::telemetry;
use crate::types::{CompletionRequest, CompletionResponse};

/// Configuration for the predictive cache and its prefetcher.
///
/// ```rust
/// # use thrifty::PredictiveConfig;
/// let config = PredictiveConfig::new()
///     .similarity_threshold(0.85)
///     .max_concurrent_prefetch(4);
/// assert!(config.prefetch_ttl >= config.ttl * 2);
/// ```
#[derive(Debug, Clone)]
pub struct PredictiveConfig {
    /// Whether the optimizer consults this tier. Default: true.
    pub enabled: bool,
    /// Minimum similarity for a fuzzy hit (inclusive). Default: 0.8.
    pub similarity_threshold: f64,
    /// TTL of organically cached entries. Default: 10 minutes.
    pub ttl: Duration,
    /// TTL of prefetched entries; must be at least twice `ttl`. Default: 30 minutes.
    pub prefetch_ttl: Duration,
    /// Maximum concurrent prefetch executions. Default: 10.
    pub max_concurrent_prefetch: usize,
    /// Capacity of the prefetch task queue. Default: 100.
    pub queue_capacity: usize,
    /// Minimum pattern frequency before it drives predictions. Default: 3.
    pub min_pattern_frequency: u64,
    /// Prediction confidence a variation must exceed to be queued. Default: 0.6.
    pub prefetch_confidence: f64,
    /// Variations kept per pattern. Default: 10.
    pub max_variations: usize,
    /// Patterns unseen for longer than this are candidates for removal. Default: 24 hours.
    pub pattern_idle_ttl: Duration,
    /// Idle patterns with fewer observations than this are removed. Default: 5.
    pub pattern_keep_frequency: u64,
    /// Interval between pattern/cache sweeps. Default: 10 minutes.
    pub sweep_interval: Duration,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.8,
            ttl: Duration::from_secs(10 * 60),
            prefetch_ttl: Duration::from_secs(30 * 60),
            max_concurrent_prefetch: 10,
            queue_capacity: 100,
            min_pattern_frequency: 3,
            prefetch_confidence: 0.6,
            max_variations: 10,
            pattern_idle_ttl: Duration::from_secs(24 * 3600),
            pattern_keep_frequency: 5,
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl PredictiveConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the tier.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the fuzzy-hit similarity threshold.
    pub fn similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Set the organic entry TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the prefetched entry TTL.
    pub fn prefetch_ttl(mut self, ttl: Duration) -> Self {
        self.prefetch_ttl = ttl;
        self
    }

    /// Set the maximum number of concurrent prefetches.
    pub fn max_concurrent_prefetch(mut self, n: usize) -> Self {
        self.max_concurrent_prefetch = n;
        self
    }

    /// Set the prefetch queue capacity.
    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    /// Set the minimum pattern frequency for prediction.
    pub fn min_pattern_frequency(mut self, n: u64) -> Self {
        self.min_pattern_frequency = n;
        self
    }

    /// Set the confidence a prediction must exceed to be prefetched.
    pub fn prefetch_confidence(mut self, confidence: f64) -> Self {
        self.prefetch_confidence = confidence;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// A predictive cache entry.
#[derive(Debug)]
struct PredictiveEntry {
    request: CompletionRequest,
    response: CompletionResponse,
    created_at: Instant,
    last_access: Mutex<Instant>,
    access_count: AtomicU64,
    confidence: f64,
    is_prefetch: bool,
}

impl PredictiveEntry {
    fn touch(&self, now: Instant) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        *self.last_access.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }
}

/// A successful predictive lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveMatch {
    pub response: CompletionResponse,
    /// 1.0 for an exact key match, otherwise the request similarity.
    pub confidence: f64,
    /// Whether the matched entry was produced by a prefetch.
    pub prefetched: bool,
}

/// Access bookkeeping of one stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryAccess {
    /// Lookups that matched this entry, plus one for an organic store.
    pub count: u64,
    pub last_access: Instant,
}

/// Read-only snapshot of predictive cache state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PredictiveStats {
    pub total_cache_entries: usize,
    pub prefetch_entries: usize,
    pub learned_patterns: usize,
    pub avg_prefetch_confidence: f64,
    /// Sum of access counters across live entries.
    pub total_accesses: u64,
    pub prefetch_queue_size: usize,
    pub exact_hits: u64,
    pub fuzzy_hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<u64, PredictiveEntry>,
    patterns: HashMap<u64, RequestPattern>,
}

/// State shared with the prediction pass and the prefetch worker.
pub(crate) struct Shared {
    state: RwLock<State>,
    pub(crate) config: PredictiveConfig,
    similarity: SimilarityConfig,
    clock: SharedClock,
    queue: mpsc::Sender<PrefetchTask>,
    exact_hits: AtomicU64,
    fuzzy_hits: AtomicU64,
    misses: AtomicU64,
}

impl Shared {
    fn is_expired(&self, entry: &PredictiveEntry, now: Instant) -> bool {
        let ttl = if entry.is_prefetch {
            self.config.prefetch_ttl
        } else {
            self.config.ttl
        };
        now.saturating_duration_since(entry.created_at) > ttl
    }

    /// Find the matching entry key and confidence without touching it.
    fn find(&self, state: &State, request: &CompletionRequest, now: Instant) -> Option<(u64, f64)> {
        let key = request.cache_key()?;

        if let Some(entry) = state.entries.get(&key)
            && entry.request.same_content(request)
            && !self.is_expired(entry, now)
        {
            return Some((key, 1.0));
        }

        let mut best: Option<(u64, f64)> = None;
        for (k, entry) in &state.entries {
            if self.is_expired(entry, now) {
                continue;
            }
            let similarity = self.similarity.request_similarity(request, &entry.request);
            if similarity >= self.config.similarity_threshold
                && best.is_none_or(|(_, s)| similarity > s)
            {
                best = Some((*k, similarity));
            }
        }
        best
    }

    /// Whether `request` would currently be served by this cache.
    pub(crate) fn is_cached(&self, request: &CompletionRequest) -> bool {
        let state = lock::read(&self.state);
        self.find(&state, request, self.clock.now()).is_some()
    }

    pub(crate) fn store_prefetch(&self, task: &PrefetchTask, response: CompletionResponse) {
        let Some(key) = task.request.cache_key() else {
            return;
        };
        let now = self.clock.now();
        let mut state = lock::write(&self.state);
        state.entries.insert(
            key,
            PredictiveEntry {
                request: task.request.clone(),
                response,
                created_at: now,
                last_access: Mutex::new(now),
                access_count: AtomicU64::new(0),
                confidence: task.confidence,
                is_prefetch: true,
            },
        );
        if let Some(pattern) = state.patterns.get_mut(&task.pattern) {
            pattern.record_outcome(true);
        }
    }

    pub(crate) fn record_prefetch_outcome(&self, pattern: u64, success: bool) {
        if let Some(pattern) = lock::write(&self.state).patterns.get_mut(&pattern) {
            pattern.record_outcome(success);
        }
    }

    /// Score every variation of every sufficiently frequent pattern against
    /// `current` and queue the confident ones.
    fn predict_next(&self, current: &CompletionRequest) -> usize {
        let now = self.clock.now();
        let mut candidates: HashMap<u64, PrefetchTask> = HashMap::new();

        {
            let state = lock::read(&self.state);
            for (pattern_id, pattern) in &state.patterns {
                if pattern.frequency < self.config.min_pattern_frequency {
                    continue;
                }
                let frequency_score = (pattern.frequency as f64 / 100.0).min(1.0);
                let recency_score = (1.0 - pattern.hours_since_seen(now) / 24.0).max(0.0);

                for variation in &pattern.variations {
                    let similarity = self.similarity.request_similarity(current, variation);
                    let confidence = (0.4 * frequency_score
                        + 0.3 * recency_score
                        + 0.3 * similarity)
                        * pattern.success_rate;
                    if confidence <= self.config.prefetch_confidence {
                        continue;
                    }
                    let Some(key) = variation.cache_key() else {
                        continue;
                    };
                    let better = candidates
                        .get(&key)
                        .is_none_or(|existing| confidence > existing.confidence);
                    if better {
                        candidates.insert(
                            key,
                            PrefetchTask {
                                request: variation.clone(),
                                confidence,
                                priority: pattern.frequency,
                                pattern: *pattern_id,
                            },
                        );
                    }
                }
            }
        }

        let mut tasks: Vec<PrefetchTask> = candidates.into_values().collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.confidence.total_cmp(&a.confidence))
        });

        let mut queued = 0;
        for task in tasks {
            if prefetch::try_enqueue(&self.queue, task) {
                queued += 1;
            }
        }
        if queued > 0 {
            debug!(queued, "prefetch tasks queued");
        }
        queued
    }
}

/// Fuzzy-match cache with pattern learning and prefetching.
pub struct PredictiveCache {
    shared: Arc<Shared>,
    receiver: Mutex<Option<mpsc::Receiver<PrefetchTask>>>,
}

impl PredictiveCache {
    /// Create a new predictive cache.
    ///
    /// Prefetching stays idle until [`start_prefetcher`](Self::start_prefetcher)
    /// is called; until then predicted tasks accumulate in the bounded queue
    /// and overflow is dropped.
    pub fn new(config: PredictiveConfig, similarity: SimilarityConfig, clock: SharedClock) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
                config,
                similarity,
                clock,
                queue: tx,
                exact_hits: AtomicU64::new(0),
                fuzzy_hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
            receiver: Mutex::new(Some(rx)),
        }
    }

    pub fn config(&self) -> &PredictiveConfig {
        &self.shared.config
    }

    /// Look up a response by exact key, then by similarity.
    ///
    /// The matched entry's access count and last-access time are updated
    /// for both match kinds.
    pub fn get(&self, request: &CompletionRequest) -> Option<PredictiveMatch> {
        let shared = &self.shared;
        let now = shared.clock.now();
        let state = lock::read(&shared.state);

        let Some((key, confidence)) = shared.find(&state, request, now) else {
            shared.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "tier" => "predictive").increment(1);
            return None;
        };

        let entry = state.entries.get(&key)?;
        entry.touch(now);

        let kind = if request.cache_key() == Some(key) && confidence >= 1.0 {
            shared.exact_hits.fetch_add(1, Ordering::Relaxed);
            "exact"
        } else {
            shared.fuzzy_hits.fetch_add(1, Ordering::Relaxed);
            "fuzzy"
        };
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "predictive", "match" => kind)
            .increment(1);

        Some(PredictiveMatch {
            response: entry.response.clone(),
            confidence,
            prefetched: entry.is_prefetch,
        })
    }

    /// Store an organic response, learn its pattern and trigger a
    /// prediction pass.
    ///
    /// The prediction pass runs on a spawned task when a runtime is
    /// available, and inline otherwise.
    pub fn set(&self, request: &CompletionRequest, response: CompletionResponse) {
        let Some(key) = request.cache_key() else {
            return;
        };
        let shared = &self.shared;
        let now = shared.clock.now();

        {
            let mut state = lock::write(&shared.state);
            state.entries.insert(
                key,
                PredictiveEntry {
                    request: request.clone(),
                    response,
                    created_at: now,
                    last_access: Mutex::new(now),
                    access_count: AtomicU64::new(1),
                    confidence: 1.0,
                    is_prefetch: false,
                },
            );

            let max_variations = shared.config.max_variations;
            state
                .patterns
                .entry(pattern_key(request))
                .and_modify(|p| p.observe(request.clone(), now, max_variations))
                .or_insert_with(|| RequestPattern::new(request.clone(), now));
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(shared);
                let current = request.clone();
                handle.spawn(async move {
                    shared.predict_next(&current);
                });
            }
            Err(_) => {
                shared.predict_next(request);
            }
        }
    }

    /// Run one prediction pass for `current` synchronously.
    ///
    /// Returns the number of tasks queued.
    pub fn predict_next(&self, current: &CompletionRequest) -> usize {
        self.shared.predict_next(current)
    }

    /// Spawn the prefetch worker.
    ///
    /// Returns `None` if the worker was already started.
    pub fn start_prefetcher(&self, executor: Arc<dyn UpstreamExecutor>) -> Option<JoinHandle<()>> {
        let rx = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let shared = Arc::clone(&self.shared);
        Some(tokio::spawn(prefetch::run_worker(shared, rx, executor)))
    }

    /// Remove idle low-frequency patterns and expired entries.
    ///
    /// Returns the total number of records removed.
    pub fn sweep(&self) -> usize {
        let shared = &self.shared;
        let now = shared.clock.now();
        let mut state = lock::write(&shared.state);

        let patterns_before = state.patterns.len();
        let idle_ttl = shared.config.pattern_idle_ttl;
        let keep_frequency = shared.config.pattern_keep_frequency;
        state.patterns.retain(|_, p| {
            now.saturating_duration_since(p.last_seen) <= idle_ttl || p.frequency >= keep_frequency
        });
        let patterns_removed = patterns_before - state.patterns.len();

        let entries_before = state.entries.len();
        state.entries.retain(|_, e| !shared.is_expired(e, now));
        let entries_removed = entries_before - state.entries.len();
        drop(state);

        let removed = patterns_removed + entries_removed;
        if removed > 0 {
            debug!(patterns_removed, entries_removed, "predictive cache sweep");
            metrics::counter!(telemetry::SWEEP_REMOVED_TOTAL, "component" => "predictive")
                .increment(removed as u64);
        }
        removed
    }

    /// Number of stored entries (organic and prefetched).
    pub fn len(&self) -> usize {
        lock::read(&self.shared.state).entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access bookkeeping of the entry stored under `request`'s exact key.
    pub fn access(&self, request: &CompletionRequest) -> Option<EntryAccess> {
        let key = request.cache_key()?;
        let state = lock::read(&self.shared.state);
        let entry = state.entries.get(&key)?;
        Some(EntryAccess {
            count: entry.access_count.load(Ordering::Relaxed),
            last_access: *entry.last_access.lock().unwrap_or_else(|e| e.into_inner()),
        })
    }

    /// Snapshot of the learned pattern for `request`'s signature, if any.
    pub fn pattern_for(&self, request: &CompletionRequest) -> Option<RequestPattern> {
        lock::read(&self.shared.state)
            .patterns
            .get(&pattern_key(request))
            .cloned()
    }

    pub fn stats(&self) -> PredictiveStats {
        let shared = &self.shared;
        let state = lock::read(&shared.state);

        let (prefetch_entries, total_confidence) = state
            .entries
            .values()
            .filter(|e| e.is_prefetch)
            .fold((0usize, 0.0f64), |(n, sum), e| (n + 1, sum + e.confidence));
        let avg_prefetch_confidence = if prefetch_entries > 0 {
            total_confidence / prefetch_entries as f64
        } else {
            0.0
        };

        let total_accesses = state
            .entries
            .values()
            .map(|e| e.access_count.load(Ordering::Relaxed))
            .sum();

        PredictiveStats {
            total_cache_entries: state.entries.len(),
            prefetch_entries,
            learned_patterns: state.patterns.len(),
            avg_prefetch_confidence,
            total_accesses,
            prefetch_queue_size: shared.queue.max_capacity() - shared.queue.capacity(),
            exact_hits: shared.exact_hits.load(Ordering::Relaxed),
            fuzzy_hits: shared.fuzzy_hits.load(Ordering::Relaxed),
            misses: shared.misses.load(Ordering::Relaxed),
        }
    }
}
