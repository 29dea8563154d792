//! In-flight request deduplication and near-duplicate merging.
//!
//! [`RequestDeduplicator::process`] resolves a request in one of four ways,
//! checked in order under a single write lock:
//!
//! 1. **Joined**: an identical request is in flight; wait for its outcome.
//! 2. **Recent**: an identical request completed within the freshness
//!    window; reuse its response.
//! 3. **Merged**: a compatible family of similar requests completed within
//!    the merge window; reuse the family's last response.
//! 4. **Executed**: start a new upstream execution on a spawned task.
//!
//! Every execution publishes its outcome into a `watch` channel shared by
//! all of its waiters, so waiters that subscribe late still observe the
//! result and publishing never blocks on a slow or departed waiter.
//!
//! Merging answers a request with the response to a *similar* one. The
//! trade-off is tuned with [`DedupConfig::merge_similarity`].

mod group;

pub use group::MergeableGroup;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use group::{RecentRequest, family_key};

use crate::clock::SharedClock;
use crate::executor::{UpstreamExecutor, timed_execute};
use crate::lock;
use crate::similarity::SimilarityConfig;
use crate::telemetry;
use crate::types::{CompletionRequest, CompletionResponse, Provenance};
use crate::{Result, ThriftyError};

/// Configuration for the request deduplicator.
///
/// ```rust
/// # use thrifty::DedupConfig;
/// # use std::time::Duration;
/// let config = DedupConfig::new()
///     .merge_similarity(0.9)
///     .staleness_bound(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Whether the optimizer routes requests through the deduplicator. Default: true.
    pub enabled: bool,
    /// Maximum age of a recent result that is served directly. Default: 2 minutes.
    pub freshness_window: Duration,
    /// A group accepts merges only this long after its last merge. Default: 5 minutes.
    pub merge_window: Duration,
    /// Last-user-message similarity a merge must exceed. Default: 0.7.
    pub merge_similarity: f64,
    /// Maximum message count difference for a merge. Default: 2.
    pub max_message_count_diff: usize,
    /// Chars of the last user message in the family signature. Default: 100.
    pub merge_key_chars: usize,
    /// Variations kept per group. Default: 10.
    pub max_variations: usize,
    /// In-flight requests older than this are failed by the sweep. Default: 2 minutes.
    pub staleness_bound: Duration,
    /// Recent records older than this are purged by the sweep. Default: 10 minutes.
    pub recent_retention: Duration,
    /// Groups unmerged for longer than this are purged by the sweep. Default: 30 minutes.
    pub group_retention: Duration,
    /// Interval between sweeps. Default: 5 minutes.
    pub sweep_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            freshness_window: Duration::from_secs(2 * 60),
            merge_window: Duration::from_secs(5 * 60),
            merge_similarity: 0.7,
            max_message_count_diff: 2,
            merge_key_chars: 100,
            max_variations: 10,
            staleness_bound: Duration::from_secs(2 * 60),
            recent_retention: Duration::from_secs(10 * 60),
            group_retention: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl DedupConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable deduplication.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the recent-result freshness window.
    pub fn freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    /// Set the merge window.
    pub fn merge_window(mut self, window: Duration) -> Self {
        self.merge_window = window;
        self
    }

    /// Set the similarity a merge must exceed.
    pub fn merge_similarity(mut self, threshold: f64) -> Self {
        self.merge_similarity = threshold;
        self
    }

    /// Set the in-flight staleness bound.
    pub fn staleness_bound(mut self, bound: Duration) -> Self {
        self.staleness_bound = bound;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// How the deduplicator resolved a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupSource {
    /// This request triggered the upstream execution.
    Executed,
    /// Shared an identical request's in-flight execution.
    Joined,
    /// Served from a just-completed identical request.
    Recent,
    /// Served from a similar request's family.
    Merged,
}

impl From<DedupSource> for Provenance {
    fn from(source: DedupSource) -> Self {
        match source {
            DedupSource::Executed => Provenance::Upstream,
            DedupSource::Joined => Provenance::Deduplicated,
            DedupSource::Recent => Provenance::Recent,
            DedupSource::Merged => Provenance::Merged,
        }
    }
}

impl DedupSource {
    fn as_label(self) -> &'static str {
        match self {
            DedupSource::Executed => "executed",
            DedupSource::Joined => "joined",
            DedupSource::Recent => "recent",
            DedupSource::Merged => "merged",
        }
    }
}

/// A resolved request.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupResponse {
    pub response: CompletionResponse,
    pub source: DedupSource,
}

/// Terminal outcome slot shared by every waiter of one execution.
type Outcome = Option<Result<CompletionResponse>>;

/// Handle to the outcome of [`RequestDeduplicator::process`].
#[derive(Debug)]
pub struct DedupTicket {
    inner: TicketInner,
}

#[derive(Debug)]
enum TicketInner {
    Ready(Result<DedupResponse>),
    Waiting {
        rx: watch::Receiver<Outcome>,
        source: DedupSource,
    },
}

impl DedupTicket {
    fn ready(result: Result<DedupResponse>) -> Self {
        Self {
            inner: TicketInner::Ready(result),
        }
    }

    /// How this request is being resolved.
    pub fn source(&self) -> Option<DedupSource> {
        match &self.inner {
            TicketInner::Ready(Ok(r)) => Some(r.source),
            TicketInner::Ready(Err(_)) => None,
            TicketInner::Waiting { source, .. } => Some(*source),
        }
    }

    /// Detached handle on the execution this ticket waits for.
    ///
    /// `None` for tickets resolved on the spot. The handle observes the same
    /// outcome as [`DedupTicket::wait`] and outlives the ticket.
    pub fn completion(&self) -> Option<Completion> {
        match &self.inner {
            TicketInner::Ready(_) => None,
            TicketInner::Waiting { rx, .. } => Some(Completion { rx: rx.clone() }),
        }
    }

    /// Wait for the terminal outcome.
    ///
    /// Fails with [`ThriftyError::Abandoned`] if the execution went away
    /// without publishing.
    pub async fn wait(self) -> Result<DedupResponse> {
        match self.inner {
            TicketInner::Ready(result) => result,
            TicketInner::Waiting { mut rx, source } => {
                let response = resolve(&mut rx).await?;
                Ok(DedupResponse { response, source })
            }
        }
    }

    /// Wait at most `bound` for the terminal outcome.
    ///
    /// Giving up only abandons this waiter; the execution keeps running for
    /// everyone else.
    pub async fn wait_timeout(self, bound: Duration) -> Result<DedupResponse> {
        tokio::time::timeout(bound, self.wait())
            .await
            .unwrap_or(Err(ThriftyError::Timeout(bound)))
    }
}

/// Outcome of one upstream execution, observed independently of its callers.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Outcome>,
}

impl Completion {
    /// Wait for the execution to publish.
    pub async fn wait(mut self) -> Result<CompletionResponse> {
        resolve(&mut self.rx).await
    }
}

async fn resolve(rx: &mut watch::Receiver<Outcome>) -> Result<CompletionResponse> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or(Err(ThriftyError::Abandoned));
        }
    }
}

/// Publish `result` unless an outcome was already published.
fn publish(sender: &watch::Sender<Outcome>, result: Result<CompletionResponse>) -> bool {
    sender.send_if_modified(|slot| {
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        true
    })
}

struct ActiveRequest {
    request: CompletionRequest,
    generation: u64,
    started_at: Instant,
    sender: Arc<watch::Sender<Outcome>>,
}

#[derive(Default)]
struct State {
    active: HashMap<u64, ActiveRequest>,
    recent: HashMap<u64, RecentRequest>,
    groups: HashMap<u64, MergeableGroup>,
}

/// Read-only snapshot of deduplicator state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub active_requests: usize,
    /// Waiters across all in-flight requests, primaries included.
    pub active_waiters: usize,
    pub recent_requests: usize,
    pub mergeable_groups: usize,
    /// Sum of merge counters across live groups.
    pub total_merges: u64,
    pub executions: u64,
    pub joins: u64,
    pub recent_hits: u64,
    pub merged_hits: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    joins: AtomicU64,
    recent_hits: AtomicU64,
    merged_hits: AtomicU64,
    timeouts: AtomicU64,
}

impl Counters {
    fn record(&self, source: DedupSource) {
        let counter = match source {
            DedupSource::Executed => &self.executions,
            DedupSource::Joined => &self.joins,
            DedupSource::Recent => &self.recent_hits,
            DedupSource::Merged => &self.merged_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::DEDUP_REQUESTS_TOTAL, "outcome" => source.as_label())
            .increment(1);
    }
}

struct Inner {
    state: RwLock<State>,
    config: DedupConfig,
    similarity: SimilarityConfig,
    clock: SharedClock,
    executor: Arc<dyn UpstreamExecutor>,
    next_generation: AtomicU64,
    counters: Counters,
}

/// Shares upstream executions between identical and similar requests.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RequestDeduplicator {
    inner: Arc<Inner>,
}

impl RequestDeduplicator {
    pub fn new(
        config: DedupConfig,
        similarity: SimilarityConfig,
        clock: SharedClock,
        executor: Arc<dyn UpstreamExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                config,
                similarity,
                clock,
                executor,
                next_generation: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.inner.config
    }

    /// Resolve a request.
    ///
    /// Never blocks on upstream work: a new execution is spawned on the
    /// current Tokio runtime, so this must be called from within one.
    /// Streaming requests and requests without messages are rejected with
    /// [`ThriftyError::InvalidInput`].
    pub fn process(&self, request: CompletionRequest) -> DedupTicket {
        if request.stream {
            return DedupTicket::ready(Err(ThriftyError::InvalidInput(
                "streaming requests cannot be deduplicated".to_string(),
            )));
        }
        if request.messages.is_empty() {
            return DedupTicket::ready(Err(ThriftyError::InvalidInput(
                "request has no messages".to_string(),
            )));
        }

        let inner = &self.inner;
        let config = &inner.config;
        let key = request.identity_key();
        let now = inner.clock.now();
        let mut state = lock::write(&inner.state);

        if let Some(active) = state.active.get(&key)
            && active.request == request
        {
            let rx = active.sender.subscribe();
            drop(state);
            inner.counters.record(DedupSource::Joined);
            debug!(model = %request.model, "joined in-flight request");
            return DedupTicket {
                inner: TicketInner::Waiting {
                    rx,
                    source: DedupSource::Joined,
                },
            };
        }

        if let Some(recent) = state.recent.get(&key)
            && recent.request == request
            && now.saturating_duration_since(recent.completed_at) <= config.freshness_window
        {
            let response = recent.response.clone();
            drop(state);
            inner.counters.record(DedupSource::Recent);
            debug!(model = %request.model, "served from recent result");
            return DedupTicket::ready(Ok(DedupResponse {
                response,
                source: DedupSource::Recent,
            }));
        }

        let family = family_key(&request, config.merge_key_chars);
        if let Some(group) = state.groups.get_mut(&family)
            && group.can_merge(&request, now, config, &inner.similarity)
        {
            group.merge(request.clone(), now, config.max_variations);
            let response = group.response.clone();
            drop(state);
            inner.counters.record(DedupSource::Merged);
            debug!(model = %request.model, "merged with similar request");
            return DedupTicket::ready(Ok(DedupResponse {
                response,
                source: DedupSource::Merged,
            }));
        }

        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let sender = Arc::new(tx);
        // A different request already owns this hash: run untracked.
        if !state.active.contains_key(&key) {
            state.active.insert(
                key,
                ActiveRequest {
                    request: request.clone(),
                    generation,
                    started_at: now,
                    sender: Arc::clone(&sender),
                },
            );
        }
        drop(state);

        inner.counters.record(DedupSource::Executed);
        tokio::spawn(execute(Arc::clone(inner), request, key, generation, sender));

        DedupTicket {
            inner: TicketInner::Waiting {
                rx,
                source: DedupSource::Executed,
            },
        }
    }

    /// Fail stale in-flight requests and purge expired records.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self) -> usize {
        let inner = &self.inner;
        let config = &inner.config;
        let now = inner.clock.now();
        let mut state = lock::write(&inner.state);

        let stale: Vec<u64> = state
            .active
            .iter()
            .filter(|(_, a)| now.saturating_duration_since(a.started_at) > config.staleness_bound)
            .map(|(k, _)| *k)
            .collect();
        let timed_out = stale.len();
        for key in stale {
            if let Some(active) = state.active.remove(&key) {
                publish(
                    &active.sender,
                    Err(ThriftyError::Timeout(config.staleness_bound)),
                );
            }
        }

        let recent_before = state.recent.len();
        state
            .recent
            .retain(|_, r| now.saturating_duration_since(r.completed_at) <= config.recent_retention);
        let groups_before = state.groups.len();
        state
            .groups
            .retain(|_, g| now.saturating_duration_since(g.last_merged) <= config.group_retention);
        let removed = timed_out
            + (recent_before - state.recent.len())
            + (groups_before - state.groups.len());
        drop(state);

        if timed_out > 0 {
            inner
                .counters
                .timeouts
                .fetch_add(timed_out as u64, Ordering::Relaxed);
            metrics::counter!(telemetry::DEDUP_TIMEOUTS_TOTAL).increment(timed_out as u64);
        }
        if removed > 0 {
            debug!(removed, timed_out, "deduplicator sweep");
            metrics::counter!(telemetry::SWEEP_REMOVED_TOTAL, "component" => "dedup")
                .increment(removed as u64);
        }
        removed
    }

    /// Whether an identical request is currently in flight.
    pub fn is_active(&self, request: &CompletionRequest) -> bool {
        lock::read(&self.inner.state)
            .active
            .get(&request.identity_key())
            .is_some_and(|a| a.request == *request)
    }

    pub fn stats(&self) -> DedupStats {
        let inner = &self.inner;
        let state = lock::read(&inner.state);
        let counters = &inner.counters;
        DedupStats {
            active_requests: state.active.len(),
            active_waiters: state
                .active
                .values()
                .map(|a| a.sender.receiver_count())
                .sum(),
            recent_requests: state.recent.len(),
            mergeable_groups: state.groups.len(),
            total_merges: state.groups.values().map(|g| g.merge_count).sum(),
            executions: counters.executions.load(Ordering::Relaxed),
            joins: counters.joins.load(Ordering::Relaxed),
            recent_hits: counters.recent_hits.load(Ordering::Relaxed),
            merged_hits: counters.merged_hits.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Run one upstream execution and settle its records.
///
/// Only the execution that still owns the active record (same generation)
/// updates the recent and group records. A result arriving after the sweep
/// has already failed the request is discarded.
async fn execute(
    inner: Arc<Inner>,
    request: CompletionRequest,
    key: u64,
    generation: u64,
    sender: Arc<watch::Sender<Outcome>>,
) {
    let result = timed_execute(inner.executor.as_ref(), &request, "dedup").await;
    let now = inner.clock.now();

    {
        let mut state = lock::write(&inner.state);
        let owner = state
            .active
            .get(&key)
            .is_some_and(|a| a.generation == generation);
        if owner {
            state.active.remove(&key);
            if let Ok(response) = &result {
                state.recent.insert(
                    key,
                    RecentRequest {
                        request: request.clone(),
                        response: response.clone(),
                        completed_at: now,
                    },
                );

                let family = family_key(&request, inner.config.merge_key_chars);
                state
                    .groups
                    .entry(family)
                    .and_modify(|g| g.refresh(response.clone(), now))
                    .or_insert_with(|| MergeableGroup::new(request.clone(), response.clone(), now));
            }
        }
    }

    if !publish(&sender, result) {
        debug!(model = %request.model, "late result discarded after timeout");
    }
}
