//! Builder for configuring optimizer instances

use std::sync::Arc;

use super::Optimizer;
use crate::cache::{PredictiveConfig, ResponseCacheConfig};
use crate::clock::{self, SharedClock};
use crate::compressor::CompressorConfig;
use crate::config::OptimizerConfig;
use crate::dedup::DedupConfig;
use crate::executor::UpstreamExecutor;
use crate::similarity::SimilarityConfig;
use crate::Result;

/// Builder for configuring optimizer instances.
pub struct OptimizerBuilder {
    executor: Arc<dyn UpstreamExecutor>,
    config: OptimizerConfig,
    clock: Option<SharedClock>,
}

impl OptimizerBuilder {
    pub fn new(executor: Arc<dyn UpstreamExecutor>) -> Self {
        Self {
            executor,
            config: OptimizerConfig::default(),
            clock: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: OptimizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Configure the response cache.
    pub fn response_cache(mut self, config: ResponseCacheConfig) -> Self {
        self.config.response_cache = config;
        self
    }

    /// Configure the predictive cache.
    pub fn predictive(mut self, config: PredictiveConfig) -> Self {
        self.config.predictive = config;
        self
    }

    /// Configure the context compressor.
    pub fn compressor(mut self, config: CompressorConfig) -> Self {
        self.config.compressor = config;
        self
    }

    /// Configure the deduplicator.
    pub fn dedup(mut self, config: DedupConfig) -> Self {
        self.config.dedup = config;
        self
    }

    /// Configure the similarity kernel shared by the predictive cache and
    /// the deduplicator.
    pub fn similarity(mut self, config: SimilarityConfig) -> Self {
        self.config.similarity = config;
        self
    }

    /// Use a custom time source (e.g. [`ManualClock`](crate::clock::ManualClock) in tests).
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and build the optimizer.
    ///
    /// Background work is not started; call [`Optimizer::start`].
    pub fn build(self) -> Result<Optimizer> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(clock::system);
        Ok(Optimizer::from_parts(self.config, clock, self.executor))
    }
}
