//! Exact-match response cache.
//!
//! [`ResponseCache`] stores completed responses keyed on the content hash
//! of `{model, messages, max_tokens}`. Streaming requests and requests
//! without messages never produce a key and always miss.
//!
//! # Expiry
//!
//! Entries older than the TTL are treated as misses on read and removed by
//! a spawned task; the periodic [`sweep`](ResponseCache::sweep) removes the
//! rest proactively.
//!
//! # Eviction
//!
//! At capacity, the entry with the lowest access count is evicted, ties
//! broken by oldest creation time. This is deliberately frequency-first
//! rather than pure recency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::clock::SharedClock;
use crate::lock;
use crate::telemetry;
use crate::types::{CompletionRequest, CompletionResponse};

/// Configuration for the response cache.
///
/// ```rust
/// # use thrifty::ResponseCacheConfig;
/// # use std::time::Duration;
/// let config = ResponseCacheConfig::new()
///     .max_entries(5_000)
///     .ttl(Duration::from_secs(300));
/// ```
#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    /// Whether the optimizer consults this tier. Default: true.
    pub enabled: bool,
    /// Maximum number of cached entries. Default: 1,000.
    pub max_entries: usize,
    /// Time-to-live for cached entries. Default: 10 minutes.
    pub ttl: Duration,
    /// Interval between proactive expiry sweeps. Default: 5 minutes.
    pub sweep_interval: Duration,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            ttl: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl ResponseCacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the tier.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum number of cached entries.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the time-to-live for cached entries.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

struct CacheEntry {
    request: CompletionRequest,
    response: CompletionResponse,
    created_at: Instant,
    access_count: AtomicU64,
}

/// Read-only snapshot of response cache state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseCacheStats {
    pub cache_size: usize,
    pub max_size: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Bounded TTL cache of completed responses.
pub struct ResponseCache {
    entries: Arc<RwLock<HashMap<u64, CacheEntry>>>,
    config: ResponseCacheConfig,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    /// Create a new response cache with the given configuration.
    pub fn new(config: ResponseCacheConfig, clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ResponseCacheConfig {
        &self.config
    }

    /// Look up a cached response.
    ///
    /// Returns `None` on miss, on expiry, and for requests that have no
    /// cache key. A hit increments the entry's access count.
    pub fn get(&self, request: &CompletionRequest) -> Option<CompletionResponse> {
        let key = request.cache_key()?;

        let expired = {
            let entries = lock::read(&self.entries);
            match entries.get(&key) {
                Some(entry) if entry.request.same_content(request) => {
                    if self.clock.since(entry.created_at) > self.config.ttl {
                        Some(entry.created_at)
                    } else {
                        entry.access_count.fetch_add(1, Ordering::Relaxed);
                        self.record_hit();
                        return Some(entry.response.clone());
                    }
                }
                _ => None,
            }
        };

        if let Some(created_at) = expired {
            self.remove_expired_later(key, created_at);
        }
        self.record_miss();
        None
    }

    /// Store a response.
    ///
    /// No-op for requests without a cache key. Evicts one entry when the
    /// cache is full and `request` is not already present.
    pub fn set(&self, request: &CompletionRequest, response: CompletionResponse) {
        let Some(key) = request.cache_key() else {
            return;
        };

        let mut entries = lock::write(&self.entries);
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            Self::evict_one(&mut entries);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "tier" => "response").increment(1);
        }
        entries.insert(
            key,
            CacheEntry {
                request: request.clone(),
                response,
                created_at: self.clock.now(),
                access_count: AtomicU64::new(0),
            },
        );
    }

    /// Whether an entry for `request` is physically present, expired or not.
    pub fn contains(&self, request: &CompletionRequest) -> bool {
        request
            .cache_key()
            .is_some_and(|key| lock::read(&self.entries).contains_key(&key))
    }

    /// Remove every TTL-expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.config.ttl;
        let mut entries = lock::write(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.created_at) <= ttl);
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            debug!(removed, "response cache sweep");
            metrics::counter!(telemetry::SWEEP_REMOVED_TOTAL, "component" => "response")
                .increment(removed as u64);
        }
        removed
    }

    /// Number of entries currently stored (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        lock::read(&self.entries).len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict all entries.
    pub fn clear(&self) {
        lock::write(&self.entries).clear();
    }

    pub fn stats(&self) -> ResponseCacheStats {
        ResponseCacheStats {
            cache_size: self.len(),
            max_size: self.config.max_entries,
            ttl_secs: self.config.ttl.as_secs(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn evict_one(entries: &mut HashMap<u64, CacheEntry>) {
        let victim = entries
            .iter()
            .min_by_key(|(_, e)| (e.access_count.load(Ordering::Relaxed), e.created_at))
            .map(|(k, _)| *k);
        if let Some(key) = victim {
            entries.remove(&key);
        }
    }

    /// Remove an expired entry on a background task, if a runtime is available.
    ///
    /// Only removes the entry created at `created_at`: a fresh `set` racing
    /// with the removal is left in place. Without a runtime the entry stays
    /// until the next sweep.
    fn remove_expired_later(&self, key: u64, created_at: Instant) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let entries = Arc::clone(&self.entries);
        handle.spawn(async move {
            let mut entries = lock::write(&entries);
            if entries.get(&key).is_some_and(|e| e.created_at == created_at) {
                entries.remove(&key);
            }
        });
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "response").increment(1);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "tier" => "response").increment(1);
    }
}
