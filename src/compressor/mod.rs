//! Importance-based context compression.
//!
//! [`ContextCompressor::compress`] shrinks long conversations before they
//! reach the caches or the upstream. Messages are scored (see
//! [`scoring`]), the highest scoring ones are kept up to a target length,
//! and every contiguous run of dropped messages is replaced by one
//! system-role placeholder carrying a short extractive summary (see
//! [`summary`]).
//!
//! System messages and the final two messages always survive. Compression
//! never fails: a request that is short enough, or that the compressor is
//! not allowed to touch, is returned as is.

pub mod scoring;
pub mod summary;

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

pub use scoring::{DEFAULT_KEYWORDS, MessageImportance, score_messages};

use crate::clock::SharedClock;
use crate::lock;
use crate::telemetry;
use crate::types::{CompletionRequest, Message};

/// Number of trailing messages that are always kept.
const KEEP_LAST: usize = 2;

/// Configuration for the context compressor.
///
/// ```rust
/// # use thrifty::CompressorConfig;
/// let config = CompressorConfig::new()
///     .max_context_length(8_000)
///     .compression_ratio(0.5)
///     .keyword("panic");
/// assert!(config.keywords.iter().any(|k| k == "panic"));
/// ```
#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// Whether the optimizer runs compression. Default: true.
    pub enabled: bool,
    /// Total message length (chars) below which requests are untouched. Default: 4,000.
    pub max_context_length: usize,
    /// Target compressed length as a fraction of the original. Default: 0.6.
    pub compression_ratio: f64,
    /// Case-insensitive keywords that raise a message's importance.
    pub keywords: Vec<String>,
    /// Age after which cached compression results are purged. Default: 1 hour.
    pub cache_ttl: Duration,
    /// Summary cache size above which the oldest half is purged. Default: 1,000.
    pub max_summary_entries: usize,
    /// Interval between cache cleanups. Default: 10 minutes.
    pub sweep_interval: Duration,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_context_length: 4_000,
            compression_ratio: 0.6,
            keywords: DEFAULT_KEYWORDS.iter().map(|k| (*k).to_string()).collect(),
            cache_ttl: Duration::from_secs(3600),
            max_summary_entries: 1_000,
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl CompressorConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable compression.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the length budget.
    pub fn max_context_length(mut self, chars: usize) -> Self {
        self.max_context_length = chars;
        self
    }

    /// Set the target compression ratio.
    pub fn compression_ratio(mut self, ratio: f64) -> Self {
        self.compression_ratio = ratio;
        self
    }

    /// Add an importance keyword.
    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into().to_lowercase());
        self
    }

    /// Replace the keyword list.
    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords
            .into_iter()
            .map(|k| k.into().to_lowercase())
            .collect();
        self
    }

    /// Set the compression cache TTL.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// A cached compression result.
#[derive(Debug)]
pub struct CompressedContext {
    pub original_messages: Vec<Message>,
    pub compressed_messages: Vec<Message>,
    /// Summaries of the omitted runs, `; `-joined.
    pub summary: String,
    /// Compressed length divided by original length.
    pub compression_ratio: f64,
    pub created_at: Instant,
    usage_count: AtomicU64,
}

impl CompressedContext {
    /// Number of times this result has been produced or reused.
    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct SummaryEntry {
    text: String,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    compressions: HashMap<u64, CompressedContext>,
    summaries: HashMap<u64, SummaryEntry>,
}

/// Read-only snapshot of compressor state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressorStats {
    pub compression_cache_size: usize,
    pub summary_cache_size: usize,
    /// Sum of usage counters across cached compressions.
    pub total_compressions: u64,
    pub avg_compression_ratio: f64,
    pub max_context_length: usize,
    pub target_compression_ratio: f64,
}

fn messages_key(messages: &[Message]) -> u64 {
    let mut hasher = DefaultHasher::new();
    messages.hash(&mut hasher);
    hasher.finish()
}

fn total_len(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.content.char_len()).sum()
}

/// Importance-based conversation pruner with result caching.
pub struct ContextCompressor {
    state: RwLock<State>,
    config: CompressorConfig,
    clock: SharedClock,
}

impl ContextCompressor {
    pub fn new(config: CompressorConfig, clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(State::default()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CompressorConfig {
        &self.config
    }

    /// Compress a request's message history.
    ///
    /// Returns `request` unchanged when compression is disabled, when the
    /// request is streaming, when it has two messages or fewer, or when its
    /// total length is within the budget.
    pub fn compress(&self, request: CompletionRequest) -> CompletionRequest {
        if !self.config.enabled || !request.is_cacheable() || request.messages.len() <= KEEP_LAST {
            return request;
        }
        let original_len = request.total_chars();
        if original_len <= self.config.max_context_length {
            return request;
        }

        let key = messages_key(&request.messages);
        if let Some(messages) = self.cached(key, &request.messages) {
            debug!(messages = messages.len(), "compression cache hit");
            metrics::counter!(telemetry::COMPRESSIONS_TOTAL, "cached" => "true").increment(1);
            return CompletionRequest {
                messages,
                ..request
            };
        }

        let (messages, summaries) = self.perform_compression(&request.messages, original_len);
        let ratio = total_len(&messages) as f64 / original_len as f64;

        debug!(
            original = request.messages.len(),
            compressed = messages.len(),
            ratio,
            "context compressed"
        );
        metrics::counter!(telemetry::COMPRESSIONS_TOTAL, "cached" => "false").increment(1);
        metrics::histogram!(telemetry::COMPRESSION_RATIO).record(ratio);

        lock::write(&self.state).compressions.insert(
            key,
            CompressedContext {
                original_messages: request.messages.clone(),
                compressed_messages: messages.clone(),
                summary: summaries.join("; "),
                compression_ratio: ratio,
                created_at: self.clock.now(),
                usage_count: AtomicU64::new(1),
            },
        );

        CompletionRequest {
            messages,
            ..request
        }
    }

    /// Purge compression results older than the cache TTL, and the oldest
    /// half of the summary cache once it outgrows its limit.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.config.cache_ttl;
        let mut state = lock::write(&self.state);

        let before = state.compressions.len();
        state
            .compressions
            .retain(|_, c| now.saturating_duration_since(c.created_at) <= ttl);
        let mut removed = before - state.compressions.len();

        if state.summaries.len() > self.config.max_summary_entries {
            let mut by_age: Vec<(u64, Instant)> = state
                .summaries
                .iter()
                .map(|(k, s)| (*k, s.created_at))
                .collect();
            by_age.sort_by_key(|(_, created_at)| *created_at);
            let excess = by_age.len() / 2;
            for (key, _) in by_age.into_iter().take(excess) {
                state.summaries.remove(&key);
            }
            removed += excess;
        }
        drop(state);

        if removed > 0 {
            debug!(removed, "compressor cache cleanup");
            metrics::counter!(telemetry::SWEEP_REMOVED_TOTAL, "component" => "compressor")
                .increment(removed as u64);
        }
        removed
    }

    /// Cached compression result for exactly `messages`, if any.
    pub fn cached_context(&self, messages: &[Message]) -> Option<(Vec<Message>, u64)> {
        let state = lock::read(&self.state);
        state
            .compressions
            .get(&messages_key(messages))
            .filter(|c| c.original_messages == messages)
            .map(|c| (c.compressed_messages.clone(), c.usage_count()))
    }

    pub fn stats(&self) -> CompressorStats {
        let state = lock::read(&self.state);
        let total_compressions = state
            .compressions
            .values()
            .map(CompressedContext::usage_count)
            .sum();
        let avg_compression_ratio = if state.compressions.is_empty() {
            0.0
        } else {
            state
                .compressions
                .values()
                .map(|c| c.compression_ratio)
                .sum::<f64>()
                / state.compressions.len() as f64
        };

        CompressorStats {
            compression_cache_size: state.compressions.len(),
            summary_cache_size: state.summaries.len(),
            total_compressions,
            avg_compression_ratio,
            max_context_length: self.config.max_context_length,
            target_compression_ratio: self.config.compression_ratio,
        }
    }

    fn cached(&self, key: u64, messages: &[Message]) -> Option<Vec<Message>> {
        let state = lock::read(&self.state);
        let context = state.compressions.get(&key)?;
        if context.original_messages != messages {
            return None;
        }
        context.usage_count.fetch_add(1, Ordering::Relaxed);
        Some(context.compressed_messages.clone())
    }

    fn perform_compression(
        &self,
        messages: &[Message],
        original_len: usize,
    ) -> (Vec<Message>, Vec<String>) {
        let importance = score_messages(messages, &self.config.keywords);
        let mut ranked: Vec<&MessageImportance> = importance.iter().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));

        let target = (original_len as f64 * self.config.compression_ratio) as usize;
        let mut keep = vec![false; messages.len()];
        let mut current = 0;
        for candidate in ranked {
            let len = messages[candidate.index].content.char_len();
            if current + len <= target {
                keep[candidate.index] = true;
                current += len;
            }
        }

        for score in &importance {
            if score.is_system {
                keep[score.index] = true;
            }
        }
        let tail = messages.len().saturating_sub(KEEP_LAST);
        for flag in &mut keep[tail..] {
            *flag = true;
        }

        let mut compressed = Vec::with_capacity(messages.len());
        let mut summaries = Vec::new();
        let mut run_start: Option<usize> = None;
        for (i, message) in messages.iter().enumerate() {
            if !keep[i] {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                continue;
            }
            if let Some(start) = run_start.take() {
                let text = self.summary_for(&messages[start..i]);
                compressed.push(Message::system(format!("[Summary: {text}]")));
                summaries.push(text);
            }
            compressed.push(message.clone());
        }

        (compressed, summaries)
    }

    fn summary_for(&self, run: &[Message]) -> String {
        let key = messages_key(run);
        if let Some(entry) = lock::read(&self.state).summaries.get(&key) {
            return entry.text.clone();
        }

        let text = summary::summarize(run);
        lock::write(&self.state).summaries.insert(
            key,
            SummaryEntry {
                text: text.clone(),
                created_at: self.clock.now(),
            },
        );
        text
    }
}
