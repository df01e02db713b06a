//! Closed-loop controller that tracks a server's apparent capacity.
//!
//! Workers feed every fetch outcome into the controller; once a full
//! sample window has accumulated, [`ConcurrencyController::adjust`]
//! re-evaluates the target parallelism. The law is AIMD-shaped: halve on a
//! deteriorating error rate or round-trip time, step up by one when both
//! signals are healthy, and hold inside the dead band between the two
//! thresholds. The window resets on every adjustment so stale samples
//! never influence the next decision.

use std::time::Duration;

use thiserror::Error;

/// Error rate above which parallelism is halved.
const ERROR_RATE_BACKOFF: f64 = 0.05;

/// Error rate below which (with healthy rtt) parallelism may grow.
const ERROR_RATE_HEALTHY: f64 = 0.01;

/// Average rtt above which parallelism is halved.
const RTT_BACKOFF: Duration = Duration::from_secs(3);

/// Average rtt below which (with healthy errors) parallelism may grow.
const RTT_HEALTHY: Duration = Duration::from_millis(1500);

/// Invalid controller bounds.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The clamp interval or initial value is inconsistent.
    #[error("invalid controller bounds: min {min} <= initial {initial} <= max {max} must hold")]
    InvalidBounds {
        /// Configured lower clamp.
        min: usize,
        /// Configured initial parallelism.
        initial: usize,
        /// Configured upper clamp.
        max: usize,
    },

    /// The sample window must contain at least one sample.
    #[error("invalid sample window: {0} (must be >= 1)")]
    InvalidWindow(usize),
}

/// Adaptive parallelism controller.
///
/// Pure state machine: callers serialise access (the coordinator keeps it
/// behind a mutex) and apply the returned target to the fetcher's permit
/// pool themselves.
#[derive(Debug)]
pub struct ConcurrencyController {
    current: usize,
    min: usize,
    max: usize,
    window: usize,

    successes: u64,
    errors: u64,
    rtt_total: Duration,
    samples: usize,
}

impl ConcurrencyController {
    /// Creates a controller with the given clamp, start value, and window.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidBounds`] unless
    /// `min <= initial <= max` with `min >= 1`, and
    /// [`ControllerError::InvalidWindow`] for an empty window.
    pub fn new(
        initial: usize,
        min: usize,
        max: usize,
        window: usize,
    ) -> Result<Self, ControllerError> {
        if min == 0 || min > initial || initial > max {
            return Err(ControllerError::InvalidBounds { min, initial, max });
        }
        if window == 0 {
            return Err(ControllerError::InvalidWindow(window));
        }

        Ok(Self {
            current: initial,
            min,
            max,
            window,
            successes: 0,
            errors: 0,
            rtt_total: Duration::ZERO,
            samples: 0,
        })
    }

    /// Current target parallelism.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Upper clamp; the coordinator requires at least this many workers.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Accumulates one fetch outcome into the open window.
    pub fn record(&mut self, success: bool, rtt: Duration) {
        if success {
            self.successes += 1;
        } else {
            self.errors += 1;
        }
        self.rtt_total += rtt;
        self.samples += 1;
    }

    /// True once a full window of samples has accumulated.
    #[must_use]
    pub fn should_adjust(&self) -> bool {
        self.samples >= self.window
    }

    /// Re-evaluates the target parallelism, resets the window, and
    /// returns the new value. With no samples this is a no-op.
    pub fn adjust(&mut self) -> usize {
        if self.samples == 0 {
            return self.current;
        }

        #[allow(clippy::cast_precision_loss)]
        let error_rate = self.errors as f64 / self.samples as f64;
        let avg_rtt = self.rtt_total / u32::try_from(self.samples).unwrap_or(u32::MAX);

        if error_rate > ERROR_RATE_BACKOFF || avg_rtt > RTT_BACKOFF {
            // Back off fast when either signal deteriorates.
            self.current = (self.current / 2).max(self.min);
        } else if error_rate < ERROR_RATE_HEALTHY && avg_rtt < RTT_HEALTHY {
            // Recover cautiously, one permit at a time.
            self.current = (self.current + 1).min(self.max);
        }

        self.successes = 0;
        self.errors = 0;
        self.rtt_total = Duration::ZERO;
        self.samples = 0;

        self.current
    }
}
