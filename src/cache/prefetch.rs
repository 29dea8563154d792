//! Speculative prefetching for the predictive cache.
//!
//! ```text
//! PredictiveCache::set
//!        │ (spawned prediction pass)
//!        ▼
//!  bounded task queue ──(full: drop)──► ∅
//!        │
//!        ▼
//!  prefetch worker ──(no spare permit: drop)──► ∅
//!        │
//!        ▼
//!  UpstreamExecutor → PredictiveCache (is_prefetch = true)
//! ```
//!
//! Prefetching is best-effort end to end: enqueueing never blocks the
//! caller, and failures never leave the worker.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::predictive::Shared;
use crate::executor::{UpstreamExecutor, timed_execute};
use crate::telemetry;
use crate::types::CompletionRequest;

/// A candidate request to execute speculatively.
#[derive(Debug, Clone)]
pub struct PrefetchTask {
    pub request: CompletionRequest,
    /// Prediction confidence in (0, 1]; stored on the resulting entry.
    pub confidence: f64,
    /// Scheduling priority (frequency of the originating pattern).
    pub priority: u64,
    /// Key of the pattern that produced this task.
    pub(crate) pattern: u64,
}

/// Enqueue without waiting. Returns `false` if the task was dropped.
pub(crate) fn try_enqueue(tx: &mpsc::Sender<PrefetchTask>, task: PrefetchTask) -> bool {
    match tx.try_send(task) {
        Ok(()) => {
            metrics::counter!(telemetry::PREFETCH_TASKS_TOTAL, "status" => "queued").increment(1);
            true
        }
        Err(_) => {
            metrics::counter!(telemetry::PREFETCH_TASKS_TOTAL, "status" => "dropped").increment(1);
            false
        }
    }
}

/// Long-lived worker loop.
///
/// Tasks whose request is already cached, or already being prefetched,
/// are skipped. `shared` owns the queue's sender, so the loop only ends
/// when its task is aborted.
pub(crate) async fn run_worker(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<PrefetchTask>,
    executor: Arc<dyn UpstreamExecutor>,
) {
    let permits = Arc::new(Semaphore::new(shared.config.max_concurrent_prefetch));
    let in_flight: Arc<Mutex<HashSet<u64>>> = Arc::default();
    info!(
        max_concurrent = shared.config.max_concurrent_prefetch,
        "prefetch worker started"
    );

    while let Some(task) = rx.recv().await {
        if shared.is_cached(&task.request) {
            metrics::counter!(telemetry::PREFETCH_TASKS_TOTAL, "status" => "skipped").increment(1);
            continue;
        }

        let Some(key) = task.request.cache_key() else {
            continue;
        };
        if lock_set(&in_flight).contains(&key) {
            metrics::counter!(telemetry::PREFETCH_TASKS_TOTAL, "status" => "skipped").increment(1);
            continue;
        }

        let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
            debug!("prefetch task dropped (no spare permit)");
            metrics::counter!(telemetry::PREFETCH_TASKS_TOTAL, "status" => "dropped").increment(1);
            continue;
        };
        lock_set(&in_flight).insert(key);

        let shared = Arc::clone(&shared);
        let executor = Arc::clone(&executor);
        let in_flight = Arc::clone(&in_flight);
        tokio::spawn(async move {
            let _permit = permit;
            match timed_execute(executor.as_ref(), &task.request, "prefetch").await {
                Ok(response) => {
                    metrics::counter!(telemetry::PREFETCH_TASKS_TOTAL, "status" => "ok")
                        .increment(1);
                    shared.store_prefetch(&task, response);
                }
                Err(_) => {
                    metrics::counter!(telemetry::PREFETCH_TASKS_TOTAL, "status" => "error")
                        .increment(1);
                    shared.record_prefetch_outcome(task.pattern, false);
                }
            }
            lock_set(&in_flight).remove(&key);
        });
    }
}

fn lock_set(set: &Mutex<HashSet<u64>>) -> std::sync::MutexGuard<'_, HashSet<u64>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}
