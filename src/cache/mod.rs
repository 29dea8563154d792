//! Caching subsystem.
//!
//! Two independent caches:
//!
//! - [`response::ResponseCache`]: exact-match cache keyed on the request
//!   content hash, with TTL expiry and frequency-first eviction.
//!
//! - [`predictive::PredictiveCache`]: similarity-matched cache that also
//!   learns request patterns and prefetches likely follow-ups through
//!   the [`prefetch`] worker.

pub mod pattern;
pub mod predictive;
pub mod prefetch;
pub mod response;

pub use pattern::RequestPattern;
pub use predictive::{
    EntryAccess, PredictiveCache, PredictiveConfig, PredictiveMatch, PredictiveStats,
};
pub use prefetch::PrefetchTask;
pub use response::{ResponseCache, ResponseCacheConfig, ResponseCacheStats};
