//! Optimizer configuration.
//!
//! [`OptimizerConfig`] aggregates the per-component runtime configs and is
//! what [`OptimizerBuilder`](crate::OptimizerBuilder) consumes.
//!
//! [`FileConfig`] is the on-disk TOML form, loaded with the following
//! resolution order:
//! 1. Explicit path (if provided)
//! 2. `~/.thrifty/config.toml` (user)
//! 3. `/etc/thrifty/config.toml` (system)
//!
//! Every field is optional in the file; durations are whole seconds in
//! `*_secs` fields.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cache::{PredictiveConfig, ResponseCacheConfig};
use crate::compressor::CompressorConfig;
use crate::dedup::DedupConfig;
use crate::similarity::SimilarityConfig;
use crate::{Result, ThriftyError};

/// Default bound on a caller's wait for a deduplicated result.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(45);

/// Complete runtime configuration.
///
/// ```rust
/// # use thrifty::{OptimizerConfig, ResponseCacheConfig};
/// # use std::time::Duration;
/// let config = OptimizerConfig::new()
///     .response_cache(ResponseCacheConfig::new().max_entries(10_000))
///     .handler_timeout(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub response_cache: ResponseCacheConfig,
    pub predictive: PredictiveConfig,
    pub compressor: CompressorConfig,
    pub dedup: DedupConfig,
    pub similarity: SimilarityConfig,
    /// Upper bound on how long `process` waits for the deduplicator. Default: 45 seconds.
    pub handler_timeout: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            response_cache: ResponseCacheConfig::default(),
            predictive: PredictiveConfig::default(),
            compressor: CompressorConfig::default(),
            dedup: DedupConfig::default(),
            similarity: SimilarityConfig::default(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }
}

impl OptimizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response_cache(mut self, config: ResponseCacheConfig) -> Self {
        self.response_cache = config;
        self
    }

    pub fn predictive(mut self, config: PredictiveConfig) -> Self {
        self.predictive = config;
        self
    }

    pub fn compressor(mut self, config: CompressorConfig) -> Self {
        self.compressor = config;
        self
    }

    pub fn dedup(mut self, config: DedupConfig) -> Self {
        self.dedup = config;
        self
    }

    pub fn similarity(mut self, config: SimilarityConfig) -> Self {
        self.similarity = config;
        self
    }

    /// Set the bound on waiting for a deduplicated result.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Check cross-field constraints.
    ///
    /// Returns [`ThriftyError::Configuration`] naming the first violation.
    pub fn validate(&self) -> Result<()> {
        let rc = &self.response_cache;
        ensure(rc.max_entries > 0, "response_cache.max_entries must be > 0")?;
        ensure(!rc.ttl.is_zero(), "response_cache.ttl must be > 0")?;
        ensure(
            !rc.sweep_interval.is_zero(),
            "response_cache.sweep_interval must be > 0",
        )?;

        let pc = &self.predictive;
        ensure(
            unit(pc.similarity_threshold),
            "predictive.similarity_threshold must be in [0, 1]",
        )?;
        ensure(
            unit(pc.prefetch_confidence),
            "predictive.prefetch_confidence must be in [0, 1]",
        )?;
        ensure(!pc.ttl.is_zero(), "predictive.ttl must be > 0")?;
        ensure(
            pc.prefetch_ttl >= pc.ttl * 2,
            "predictive.prefetch_ttl must be at least twice predictive.ttl",
        )?;
        ensure(
            pc.max_concurrent_prefetch > 0,
            "predictive.max_concurrent_prefetch must be > 0",
        )?;
        ensure(pc.queue_capacity > 0, "predictive.queue_capacity must be > 0")?;
        ensure(pc.max_variations > 0, "predictive.max_variations must be > 0")?;
        ensure(
            !pc.sweep_interval.is_zero(),
            "predictive.sweep_interval must be > 0",
        )?;

        let cc = &self.compressor;
        ensure(
            cc.compression_ratio > 0.0 && cc.compression_ratio <= 1.0,
            "compressor.compression_ratio must be in (0, 1]",
        )?;
        ensure(
            cc.max_summary_entries > 0,
            "compressor.max_summary_entries must be > 0",
        )?;
        ensure(
            !cc.sweep_interval.is_zero(),
            "compressor.sweep_interval must be > 0",
        )?;

        let dc = &self.dedup;
        ensure(
            unit(dc.merge_similarity),
            "dedup.merge_similarity must be in [0, 1]",
        )?;
        ensure(dc.max_variations > 0, "dedup.max_variations must be > 0")?;
        ensure(!dc.staleness_bound.is_zero(), "dedup.staleness_bound must be > 0")?;
        ensure(!dc.sweep_interval.is_zero(), "dedup.sweep_interval must be > 0")?;

        let sc = &self.similarity;
        ensure(
            sc.model_weight >= 0.0 && sc.message_count_weight >= 0.0 && sc.content_weight >= 0.0,
            "similarity weights must be non-negative",
        )?;
        ensure(
            sc.model_weight + sc.message_count_weight + sc.content_weight > 0.0,
            "similarity weights must sum to more than 0",
        )?;

        ensure(!self.handler_timeout.is_zero(), "handler_timeout must be > 0")
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(ThriftyError::Configuration(message.to_string()))
    }
}

fn unit(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

fn secs(d: Duration) -> u64 {
    d.as_secs()
}

// ===== File layer =====

/// On-disk configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub optimizer: OptimizerSection,
    pub response_cache: ResponseCacheSection,
    pub predictive: PredictiveSection,
    pub compressor: CompressorSection,
    pub dedup: DedupSection,
    pub similarity: SimilaritySection,
}

/// `[optimizer]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptimizerSection {
    /// Default: 45.
    pub handler_timeout_secs: u64,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            handler_timeout_secs: secs(DEFAULT_HANDLER_TIMEOUT),
        }
    }
}

/// `[response_cache]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResponseCacheSection {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ResponseCacheSection {
    fn default() -> Self {
        let d = ResponseCacheConfig::default();
        Self {
            enabled: d.enabled,
            max_entries: d.max_entries,
            ttl_secs: secs(d.ttl),
            sweep_interval_secs: secs(d.sweep_interval),
        }
    }
}

impl From<ResponseCacheSection> for ResponseCacheConfig {
    fn from(s: ResponseCacheSection) -> Self {
        ResponseCacheConfig::new()
            .enabled(s.enabled)
            .max_entries(s.max_entries)
            .ttl(Duration::from_secs(s.ttl_secs))
            .sweep_interval(Duration::from_secs(s.sweep_interval_secs))
    }
}

/// `[predictive]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictiveSection {
    pub enabled: bool,
    pub similarity_threshold: f64,
    pub ttl_secs: u64,
    pub prefetch_ttl_secs: u64,
    pub max_concurrent_prefetch: usize,
    pub queue_capacity: usize,
    pub min_pattern_frequency: u64,
    pub prefetch_confidence: f64,
    pub max_variations: usize,
    pub pattern_idle_ttl_secs: u64,
    pub pattern_keep_frequency: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PredictiveSection {
    fn default() -> Self {
        let d = PredictiveConfig::default();
        Self {
            enabled: d.enabled,
            similarity_threshold: d.similarity_threshold,
            ttl_secs: secs(d.ttl),
            prefetch_ttl_secs: secs(d.prefetch_ttl),
            max_concurrent_prefetch: d.max_concurrent_prefetch,
            queue_capacity: d.queue_capacity,
            min_pattern_frequency: d.min_pattern_frequency,
            prefetch_confidence: d.prefetch_confidence,
            max_variations: d.max_variations,
            pattern_idle_ttl_secs: secs(d.pattern_idle_ttl),
            pattern_keep_frequency: d.pattern_keep_frequency,
            sweep_interval_secs: secs(d.sweep_interval),
        }
    }
}

impl From<PredictiveSection> for PredictiveConfig {
    fn from(s: PredictiveSection) -> Self {
        PredictiveConfig {
            enabled: s.enabled,
            similarity_threshold: s.similarity_threshold,
            ttl: Duration::from_secs(s.ttl_secs),
            prefetch_ttl: Duration::from_secs(s.prefetch_ttl_secs),
            max_concurrent_prefetch: s.max_concurrent_prefetch,
            queue_capacity: s.queue_capacity,
            min_pattern_frequency: s.min_pattern_frequency,
            prefetch_confidence: s.prefetch_confidence,
            max_variations: s.max_variations,
            pattern_idle_ttl: Duration::from_secs(s.pattern_idle_ttl_secs),
            pattern_keep_frequency: s.pattern_keep_frequency,
            sweep_interval: Duration::from_secs(s.sweep_interval_secs),
        }
    }
}

/// `[compressor]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressorSection {
    pub enabled: bool,
    pub max_context_length: usize,
    pub compression_ratio: f64,
    /// Replaces the built-in keyword list when set.
    pub keywords: Option<Vec<String>>,
    pub cache_ttl_secs: u64,
    pub max_summary_entries: usize,
    pub sweep_interval_secs: u64,
}

impl Default for CompressorSection {
    fn default() -> Self {
        let d = CompressorConfig::default();
        Self {
            enabled: d.enabled,
            max_context_length: d.max_context_length,
            compression_ratio: d.compression_ratio,
            keywords: None,
            cache_ttl_secs: secs(d.cache_ttl),
            max_summary_entries: d.max_summary_entries,
            sweep_interval_secs: secs(d.sweep_interval),
        }
    }
}

impl From<CompressorSection> for CompressorConfig {
    fn from(s: CompressorSection) -> Self {
        let mut config = CompressorConfig::new()
            .enabled(s.enabled)
            .max_context_length(s.max_context_length)
            .compression_ratio(s.compression_ratio)
            .cache_ttl(Duration::from_secs(s.cache_ttl_secs))
            .sweep_interval(Duration::from_secs(s.sweep_interval_secs));
        config.max_summary_entries = s.max_summary_entries;
        if let Some(keywords) = s.keywords {
            config = config.keywords(keywords);
        }
        config
    }
}

/// `[dedup]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    pub enabled: bool,
    pub freshness_window_secs: u64,
    pub merge_window_secs: u64,
    pub merge_similarity: f64,
    pub max_message_count_diff: usize,
    pub merge_key_chars: usize,
    pub max_variations: usize,
    pub staleness_bound_secs: u64,
    pub recent_retention_secs: u64,
    pub group_retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for DedupSection {
    fn default() -> Self {
        let d = DedupConfig::default();
        Self {
            enabled: d.enabled,
            freshness_window_secs: secs(d.freshness_window),
            merge_window_secs: secs(d.merge_window),
            merge_similarity: d.merge_similarity,
            max_message_count_diff: d.max_message_count_diff,
            merge_key_chars: d.merge_key_chars,
            max_variations: d.max_variations,
            staleness_bound_secs: secs(d.staleness_bound),
            recent_retention_secs: secs(d.recent_retention),
            group_retention_secs: secs(d.group_retention),
            sweep_interval_secs: secs(d.sweep_interval),
        }
    }
}

impl From<DedupSection> for DedupConfig {
    fn from(s: DedupSection) -> Self {
        DedupConfig {
            enabled: s.enabled,
            freshness_window: Duration::from_secs(s.freshness_window_secs),
            merge_window: Duration::from_secs(s.merge_window_secs),
            merge_similarity: s.merge_similarity,
            max_message_count_diff: s.max_message_count_diff,
            merge_key_chars: s.merge_key_chars,
            max_variations: s.max_variations,
            staleness_bound: Duration::from_secs(s.staleness_bound_secs),
            recent_retention: Duration::from_secs(s.recent_retention_secs),
            group_retention: Duration::from_secs(s.group_retention_secs),
            sweep_interval: Duration::from_secs(s.sweep_interval_secs),
        }
    }
}

/// `[similarity]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimilaritySection {
    pub max_edit_len: usize,
    pub model_weight: f64,
    pub message_count_weight: f64,
    pub content_weight: f64,
}

impl Default for SimilaritySection {
    fn default() -> Self {
        let d = SimilarityConfig::default();
        Self {
            max_edit_len: d.max_edit_len,
            model_weight: d.model_weight,
            message_count_weight: d.message_count_weight,
            content_weight: d.content_weight,
        }
    }
}

impl From<SimilaritySection> for SimilarityConfig {
    fn from(s: SimilaritySection) -> Self {
        SimilarityConfig {
            max_edit_len: s.max_edit_len,
            model_weight: s.model_weight,
            message_count_weight: s.message_count_weight,
            content_weight: s.content_weight,
        }
    }
}

impl From<FileConfig> for OptimizerConfig {
    fn from(file: FileConfig) -> Self {
        OptimizerConfig {
            response_cache: file.response_cache.into(),
            predictive: file.predictive.into(),
            compressor: file.compressor.into(),
            dedup: file.dedup.into(),
            similarity: file.similarity.into(),
            handler_timeout: Duration::from_secs(file.optimizer.handler_timeout_secs),
        }
    }
}

impl FileConfig {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.thrifty/config.toml`
    /// 3. `/etc/thrifty/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        Self::load_from_file(&path)
    }

    /// Parse a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ThriftyError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::parse(&content).map_err(|e| match e {
            ThriftyError::Configuration(msg) => {
                ThriftyError::Configuration(format!("Failed to parse config file {path:?}: {msg}"))
            }
            other => other,
        })
    }

    /// Parse TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ThriftyError::Configuration(e.to_string()))
    }

    /// Convert into a validated runtime config.
    pub fn into_config(self) -> Result<OptimizerConfig> {
        let config = OptimizerConfig::from(self);
        config.validate()?;
        Ok(config)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(ThriftyError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".thrifty").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/thrifty/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(ThriftyError::Configuration(
            "No config file found. Create ~/.thrifty/config.toml or /etc/thrifty/config.toml"
                .to_string(),
        ))
    }
}
