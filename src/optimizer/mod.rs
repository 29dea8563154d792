//! The optimizer facade.
//!
//! [`Optimizer`] owns one instance of each component and runs a request
//! through them:
//!
//! ```text
//! request ─► stream? ──yes──► executor (Passthrough)
//!              │ no
//!              ▼
//!          compressor ─► predictive cache ─► response cache ─► deduplicator
//!                             │ hit               │ hit             │
//!                             ▼                   ▼                 ▼
//!                       PredictiveHit          ExactHit   Upstream / Deduplicated
//!                                                          / Recent / Merged
//! ```
//!
//! Responses produced by a fresh upstream execution are written back into
//! both caches on a spawned task, so the caller never waits on cache
//! population. The write-back also happens when the triggering caller
//! times out or is dropped before the execution finishes.

mod builder;

pub use builder::OptimizerBuilder;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::cache::{PredictiveCache, PredictiveStats, ResponseCache, ResponseCacheStats};
use crate::clock::SharedClock;
use crate::compressor::{CompressorStats, ContextCompressor};
use crate::config::OptimizerConfig;
use crate::dedup::{Completion, DedupSource, DedupStats, RequestDeduplicator};
use crate::executor::{UpstreamExecutor, timed_execute};
use crate::sweeper::Sweepers;
use crate::types::{CompletionRequest, CompletionResponse, Provenance, Served};
use crate::{Result, ThriftyError};

/// Statistics snapshot across every component.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizerStats {
    pub response_cache: ResponseCacheStats,
    pub predictive: PredictiveStats,
    pub compressor: CompressorStats,
    pub dedup: DedupStats,
}

/// Records removed by one [`Optimizer::run_sweeps`] call, per component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub response_cache: usize,
    pub predictive: usize,
    pub compressor: usize,
    pub dedup: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.response_cache + self.predictive + self.compressor + self.dedup
    }
}

#[derive(Default)]
struct Background {
    sweepers: Sweepers,
    prefetcher: Option<JoinHandle<()>>,
}

impl Drop for Background {
    fn drop(&mut self) {
        if let Some(handle) = self.prefetcher.take() {
            handle.abort();
        }
    }
}

/// Caches a fresh execution's result is written into.
#[derive(Clone)]
struct CacheTargets {
    response_cache: Option<Arc<ResponseCache>>,
    predictive: Option<Arc<PredictiveCache>>,
}

impl CacheTargets {
    fn is_empty(&self) -> bool {
        self.response_cache.is_none() && self.predictive.is_none()
    }

    fn store(&self, request: &CompletionRequest, response: CompletionResponse) {
        if let Some(cache) = &self.response_cache {
            cache.set(request, response.clone());
        }
        if let Some(cache) = &self.predictive {
            cache.set(request, response);
        }
    }
}

/// Cache write-back owed by the caller that triggered an execution.
///
/// [`PendingWriteBack::finish`] stores the result on a spawned task once the
/// caller has it. If the caller stops waiting first (handler timeout or a
/// dropped future), dropping the guard hands the execution's [`Completion`]
/// to a detached task that stores the result when it lands.
struct PendingWriteBack {
    targets: CacheTargets,
    request: Option<CompletionRequest>,
    completion: Option<Completion>,
}

impl PendingWriteBack {
    fn new(
        targets: CacheTargets,
        request: CompletionRequest,
        completion: Option<Completion>,
    ) -> Self {
        Self {
            targets,
            request: Some(request),
            completion,
        }
    }

    fn finish(mut self, response: CompletionResponse) {
        self.completion = None;
        if let Some(request) = self.request.take() {
            let targets = self.targets.clone();
            tokio::spawn(async move { targets.store(&request, response) });
        }
    }
}

impl Drop for PendingWriteBack {
    fn drop(&mut self) {
        let (Some(completion), Some(request)) = (self.completion.take(), self.request.take())
        else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let targets = self.targets.clone();
        runtime.spawn(async move {
            match completion.wait().await {
                Ok(response) => {
                    debug!(model = %request.model, "caching result for departed caller");
                    targets.store(&request, response);
                }
                Err(err) => debug!(error = %err, "execution failed, nothing cached"),
            }
        });
    }
}

/// Caching and deduplication front for an upstream completion API.
pub struct Optimizer {
    config: OptimizerConfig,
    executor: Arc<dyn UpstreamExecutor>,
    compressor: Arc<ContextCompressor>,
    response_cache: Arc<ResponseCache>,
    predictive: Arc<PredictiveCache>,
    dedup: RequestDeduplicator,
    background: Mutex<Background>,
}

impl Optimizer {
    /// Create a new builder around the upstream executor.
    pub fn builder(executor: Arc<dyn UpstreamExecutor>) -> OptimizerBuilder {
        OptimizerBuilder::new(executor)
    }

    pub(crate) fn from_parts(
        config: OptimizerConfig,
        clock: SharedClock,
        executor: Arc<dyn UpstreamExecutor>,
    ) -> Self {
        let compressor = ContextCompressor::new(config.compressor.clone(), Arc::clone(&clock));
        let response_cache =
            ResponseCache::new(config.response_cache.clone(), Arc::clone(&clock));
        let predictive = PredictiveCache::new(
            config.predictive.clone(),
            config.similarity,
            Arc::clone(&clock),
        );
        let dedup = RequestDeduplicator::new(
            config.dedup.clone(),
            config.similarity,
            clock,
            Arc::clone(&executor),
        );

        Self {
            config,
            executor,
            compressor: Arc::new(compressor),
            response_cache: Arc::new(response_cache),
            predictive: Arc::new(predictive),
            dedup,
            background: Mutex::new(Background::default()),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn compressor(&self) -> &ContextCompressor {
        &self.compressor
    }

    pub fn response_cache(&self) -> &ResponseCache {
        &self.response_cache
    }

    pub fn predictive_cache(&self) -> &PredictiveCache {
        &self.predictive
    }

    pub fn deduplicator(&self) -> &RequestDeduplicator {
        &self.dedup
    }

    /// Serve one request.
    ///
    /// Streaming requests go straight to the executor. Requests without
    /// messages are rejected with [`ThriftyError::InvalidInput`]. Upstream
    /// failures are returned to every waiter of the failed execution and
    /// are never cached.
    #[instrument(skip(self, request), fields(model = %request.model, messages = request.messages.len()))]
    pub async fn process(&self, request: CompletionRequest) -> Result<Served> {
        if request.stream {
            debug!("streaming request passed through");
            let response = timed_execute(self.executor.as_ref(), &request, "passthrough").await?;
            return Ok(Served::new(response, Provenance::Passthrough));
        }
        if request.messages.is_empty() {
            return Err(ThriftyError::InvalidInput(
                "request has no messages".to_string(),
            ));
        }

        let request = self.compressor.compress(request);

        if self.config.predictive.enabled
            && let Some(hit) = self.predictive.get(&request)
        {
            debug!(confidence = hit.confidence, prefetched = hit.prefetched, "predictive hit");
            return Ok(Served::new(
                hit.response,
                Provenance::PredictiveHit {
                    confidence: hit.confidence,
                },
            ));
        }

        if self.config.response_cache.enabled
            && let Some(response) = self.response_cache.get(&request)
        {
            debug!("response cache hit");
            return Ok(Served::new(response, Provenance::ExactHit));
        }

        let timeout = self.config.handler_timeout;
        let targets = self.cache_targets();
        if !self.config.dedup.enabled {
            let executor = Arc::clone(&self.executor);
            let direct = request;
            // Spawned so the result is cached even if this caller gives up.
            let handle = tokio::spawn(async move {
                let result = timed_execute(executor.as_ref(), &direct, "direct").await;
                if let Ok(response) = &result {
                    targets.store(&direct, response.clone());
                }
                result
            });
            let response = match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(result)) => result?,
                Ok(Err(err)) => return Err(ThriftyError::Upstream(err.to_string())),
                Err(_) => return Err(ThriftyError::Timeout(timeout)),
            };
            return Ok(Served::new(response, Provenance::Upstream));
        }

        let ticket = self.dedup.process(request.clone());
        let pending = match ticket.source() {
            Some(DedupSource::Executed) if !targets.is_empty() => {
                Some(PendingWriteBack::new(targets, request, ticket.completion()))
            }
            _ => None,
        };
        let resolved = ticket.wait_timeout(timeout).await?;
        debug!(source = ?resolved.source, "deduplicator resolved request");
        if let Some(pending) = pending {
            pending.finish(resolved.response.clone());
        }
        Ok(Served::new(resolved.response, resolved.source.into()))
    }

    fn cache_targets(&self) -> CacheTargets {
        CacheTargets {
            response_cache: self
                .config
                .response_cache
                .enabled
                .then(|| Arc::clone(&self.response_cache)),
            predictive: self
                .config
                .predictive
                .enabled
                .then(|| Arc::clone(&self.predictive)),
        }
    }

    /// Start the periodic sweepers and the prefetch worker.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while
    /// running is a no-op. The prefetch worker can only be started once
    /// per optimizer.
    pub fn start(&self) {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        if !background.sweepers.is_empty() {
            return;
        }

        let cache = Arc::clone(&self.response_cache);
        background.sweepers.spawn(
            "response",
            self.config.response_cache.sweep_interval,
            move || cache.sweep(),
        );
        let cache = Arc::clone(&self.predictive);
        background.sweepers.spawn(
            "predictive",
            self.config.predictive.sweep_interval,
            move || cache.sweep(),
        );
        let compressor = Arc::clone(&self.compressor);
        background.sweepers.spawn(
            "compressor",
            self.config.compressor.sweep_interval,
            move || compressor.sweep(),
        );
        let dedup = self.dedup.clone();
        background
            .sweepers
            .spawn("dedup", self.config.dedup.sweep_interval, move || {
                dedup.sweep()
            });

        if self.config.predictive.enabled && background.prefetcher.is_none() {
            background.prefetcher = self.predictive.start_prefetcher(Arc::clone(&self.executor));
        }
        info!(
            sweepers = background.sweepers.len(),
            prefetch = background.prefetcher.is_some(),
            "optimizer started"
        );
    }

    /// Stop the sweepers and the prefetch worker.
    ///
    /// In-flight upstream executions are not cancelled.
    pub fn shutdown(&self) {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        background.sweepers.shutdown();
        if let Some(handle) = background.prefetcher.take() {
            handle.abort();
        }
        info!("optimizer stopped");
    }

    /// Whether background work is running.
    pub fn is_running(&self) -> bool {
        !self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sweepers
            .is_empty()
    }

    /// Run every component's sweep now.
    pub fn run_sweeps(&self) -> SweepReport {
        let report = SweepReport {
            response_cache: self.response_cache.sweep(),
            predictive: self.predictive.sweep(),
            compressor: self.compressor.sweep(),
            dedup: self.dedup.sweep(),
        };
        debug!(removed = report.total(), "manual sweep");
        report
    }

    pub fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            response_cache: self.response_cache.stats(),
            predictive: self.predictive.stats(),
            compressor: self.compressor.stats(),
            dedup: self.dedup.stats(),
        }
    }
}
