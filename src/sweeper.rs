//! Periodic background sweeps.
//!
//! One interval loop per component. Missed ticks are delayed rather than
//! bursted, and the immediate first tick is skipped so a freshly started
//! optimizer does not sweep empty state. Loops are aborted on
//! [`Sweepers::shutdown`] or when the [`Sweepers`] value is dropped.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Owned set of periodic sweep loops.
#[derive(Debug, Default)]
pub struct Sweepers {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Sweepers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a loop calling `sweep` every `period`.
    ///
    /// `sweep` returns the number of records it removed. A zero period is
    /// rejected with a warning and nothing is spawned.
    pub fn spawn<F>(&mut self, name: &'static str, period: Duration, sweep: F)
    where
        F: Fn() -> usize + Send + 'static,
    {
        if period.is_zero() {
            warn!(component = name, "sweep interval is zero, sweeper not started");
            return;
        }

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = sweep();
                debug!(component = name, removed, "periodic sweep");
            }
        });
        info!(component = name, ?period, "sweeper started");
        self.handles.push((name, handle));
    }

    /// Number of running loops.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Names of the running loops, in start order.
    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Abort every loop.
    pub fn shutdown(&mut self) {
        for (name, handle) in self.handles.drain(..) {
            handle.abort();
            debug!(component = name, "sweeper stopped");
        }
    }
}

impl Drop for Sweepers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_after_each_period_and_stops_on_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut sweepers = Sweepers::new();
        let counter = Arc::clone(&calls);
        sweepers.spawn("test", Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            0
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "first tick is skipped");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        sweepers.shutdown();
        assert!(sweepers.is_empty());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_period_is_rejected() {
        let mut sweepers = Sweepers::new();
        sweepers.spawn("noop", Duration::ZERO, || 0);
        assert!(sweepers.is_empty());

        sweepers.spawn("dedup", Duration::from_secs(60), || 0);
        assert_eq!(sweepers.names(), vec!["dedup"]);
    }
}
