//! Injectable time source.
//!
//! Every TTL, freshness window and staleness bound in the crate is measured
//! against a [`Clock`] rather than calling `Instant::now()` directly, so
//! tests can move time forward deterministically with [`ManualClock`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Time elapsed since `earlier`, saturating at zero.
    fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Wall-clock backed [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced [`Clock`] for tests.
///
/// ```rust
/// # use thrifty::clock::{Clock, ManualClock};
/// # use std::time::Duration;
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(90));
/// assert_eq!(clock.since(start), Duration::from_secs(90));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Create a shareable clock.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.base + *offset
    }
}

/// Shared handle to the clock used by every component.
pub type SharedClock = Arc<dyn Clock>;

/// Default clock handle.
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}
