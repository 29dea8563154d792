//! Telemetry metric name constants.
//!
//! Centralised metric names for thrifty operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `thrifty_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `tier`: cache tier: "response" or "predictive"
//! - `match`: predictive match kind: "exact" or "fuzzy"
//! - `outcome`: deduplicator outcome: "executed", "joined", "recent", "merged"
//! - `status`: outcome: "ok" or "error"
//! - `component`: sweep owner: "response", "predictive", "compressor", "dedup"
//! - `cached`: compression result reused from cache: "true" or "false"

/// Total cache hits.
///
/// Labels: `tier`, plus `match` on the predictive tier.
pub const CACHE_HITS_TOTAL: &str = "thrifty_cache_hits_total";

/// Total cache misses.
///
/// Labels: `tier`.
pub const CACHE_MISSES_TOTAL: &str = "thrifty_cache_misses_total";

/// Total entries evicted to make room for a new one.
///
/// Labels: `tier`.
pub const CACHE_EVICTIONS_TOTAL: &str = "thrifty_cache_evictions_total";

/// Total requests resolved by the deduplicator.
///
/// Labels: `outcome`.
pub const DEDUP_REQUESTS_TOTAL: &str = "thrifty_dedup_requests_total";

/// Total in-flight requests force-completed by the staleness sweep.
pub const DEDUP_TIMEOUTS_TOTAL: &str = "thrifty_dedup_timeouts_total";

/// Total compression passes that rewrote a request.
///
/// Labels: `cached`.
pub const COMPRESSIONS_TOTAL: &str = "thrifty_compressions_total";

/// Achieved compression ratio (compressed length / original length).
pub const COMPRESSION_RATIO: &str = "thrifty_compression_ratio";

/// Total prefetch tasks by lifecycle stage.
///
/// Labels: `status` ("queued" | "dropped" | "ok" | "error" | "skipped").
pub const PREFETCH_TASKS_TOTAL: &str = "thrifty_prefetch_tasks_total";

/// Upstream execution duration in seconds.
///
/// Labels: `executor`, `status`.
pub const UPSTREAM_DURATION_SECONDS: &str = "thrifty_upstream_duration_seconds";

/// Total records removed by periodic sweeps.
///
/// Labels: `component`.
pub const SWEEP_REMOVED_TOTAL: &str = "thrifty_sweep_removed_total";
