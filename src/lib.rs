//! Thrifty - Adaptive caching and deduplication for LLM completion APIs
//!
//! This crate sits in front of an upstream completion API and avoids
//! paying for the same answer twice. A request passes through four
//! cooperating components:
//!
//! - [`ContextCompressor`] prunes long conversation histories.
//! - [`PredictiveCache`] answers near-identical requests and prefetches
//!   likely follow-ups from learned request patterns.
//! - [`ResponseCache`] answers exact repeats.
//! - [`RequestDeduplicator`] shares in-flight executions between identical
//!   requests and merges near-duplicates into one family response.
//!
//! The network side is injected through [`UpstreamExecutor`]; every served
//! response carries a [`Provenance`] tag describing where it came from.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use thrifty::{CompletionRequest, CompletionResponse, Message, Optimizer, UpstreamExecutor};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl UpstreamExecutor for Echo {
//!     async fn execute(&self, request: &CompletionRequest) -> thrifty::Result<CompletionResponse> {
//!         Ok(CompletionResponse::text(request.conversation_text()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> thrifty::Result<()> {
//!     let optimizer = Optimizer::builder(Arc::new(Echo)).build()?;
//!     optimizer.start();
//!
//!     let served = optimizer
//!         .process(CompletionRequest::new("m1", vec![Message::user("ping")]))
//!         .await?;
//!     println!("{} ({})", served.response.content, served.provenance.as_header_value());
//!
//!     optimizer.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod compressor;
pub mod config;
pub mod dedup;
pub mod error;
pub mod executor;
mod lock;
pub mod optimizer;
pub mod similarity;
pub mod sweeper;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use error::{Result, ThriftyError};
pub use executor::UpstreamExecutor;
pub use optimizer::{Optimizer, OptimizerBuilder, OptimizerStats, SweepReport};

pub use cache::{
    EntryAccess, PredictiveCache, PredictiveConfig, PredictiveMatch, PredictiveStats, PrefetchTask,
    RequestPattern, ResponseCache, ResponseCacheConfig, ResponseCacheStats,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use compressor::{CompressorConfig, CompressorStats, ContextCompressor, MessageImportance};
pub use config::{FileConfig, OptimizerConfig};
pub use dedup::{
    Completion, DedupConfig, DedupResponse, DedupSource, DedupStats, DedupTicket, MergeableGroup,
    RequestDeduplicator,
};
pub use similarity::SimilarityConfig;
pub use sweeper::Sweepers;

// Re-export all types
pub use types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, MessageContent, Provenance,
    Role, Served, StopReason, SystemPrompt, Usage,
};
