//! Upstream executor seam.
//!
//! The core never talks to the network itself. Whatever actually sends a
//! request upstream (HTTP client, token refresh, wire-format translation)
//! implements [`UpstreamExecutor`] and is injected into the optimizer.
//!
//! # Fault isolation
//!
//! Every failure is treated as non-cacheable. Executions are only ever run
//! on spawned tasks: the deduplicator publishes failures to the waiters of
//! that request, the prefetcher swallows them.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::warn;

use crate::telemetry;
use crate::types::{CompletionRequest, CompletionResponse};
use crate::{Result, ThriftyError};

/// Executes a completion request against the upstream provider.
#[async_trait]
pub trait UpstreamExecutor: Send + Sync {
    /// Executor name for logging/metrics.
    fn name(&self) -> &str {
        "upstream"
    }

    /// Execute a request to completion.
    async fn execute(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// Execute a request, recording duration metrics.
///
/// A panicking executor is reported as an upstream error instead of
/// unwinding through the spawned task, so waiters are never left hanging
/// until the staleness sweep.
pub(crate) async fn timed_execute(
    executor: &dyn UpstreamExecutor,
    request: &CompletionRequest,
    purpose: &'static str,
) -> Result<CompletionResponse> {
    let start = Instant::now();
    let result = AssertUnwindSafe(executor.execute(request))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(ThriftyError::Upstream("executor panicked".to_string())));

    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::histogram!(telemetry::UPSTREAM_DURATION_SECONDS,
        "executor" => executor.name().to_owned(),
        "status" => status,
    )
    .record(start.elapsed().as_secs_f64());

    if let Err(ref e) = result {
        warn!(
            executor = executor.name(),
            purpose,
            model = %request.model,
            error = %e,
            "upstream execution failed"
        );
    }
    result
}
