//! Process-wide crawl counters.
//!
//! A single [`Metrics`] value is shared by every worker; the reporter task
//! in the coordinator reads it periodically together with the store's
//! queue depth. The two counters live under one lock so a snapshot is
//! always a consistent pair.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default seconds between reporter lines.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    visited: u64,
    errors: u64,
}

/// Visited/error counters plus the crawl start instant.
///
/// Counters are monotonically non-decreasing for the process lifetime.
#[derive(Debug)]
pub struct Metrics {
    start: Instant,
    counts: Mutex<Counts>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates zeroed counters with the clock starting now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Counts one URL marked visited.
    pub fn inc_visited(&self) {
        self.lock().visited += 1;
    }

    /// Counts one fetch or store failure.
    pub fn inc_error(&self) {
        self.lock().errors += 1;
    }

    /// Returns `(visited, errors)` as one consistent pair.
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        let counts = self.lock();
        (counts.visited, counts.errors)
    }

    /// Time elapsed since the crawl started.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start.elapsed()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
