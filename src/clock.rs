//! Monotonic clock capability for the session coordinator.
//!
//! All duration-based computations in the runtime (running-speed windows, pause
//! accounting, imaging staleness checks) read time through the [`MonotonicClock`]
//! trait instead of touching `Instant` directly. This keeps the control loop
//! deterministic under test: the integration tests drive a [`ManualClock`] forward
//! in explicit steps, while production code injects a [`SystemClock`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic elapsed time, measured from an arbitrary origin.
///
/// Implementations must be cheap to query and never move backwards.
pub trait MonotonicClock: Send {
    /// Time elapsed since the clock's origin.
    fn elapsed(&self) -> Duration;
}

/// Production clock backed by [`Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually-advanced clock for tests.
///
/// Cloning the handle shares the underlying time cell, so a test can hold one
/// handle while the coordinator owns another.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Creates a manual clock at origin (zero elapsed time).
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Advances the clock by `step`.
    pub fn advance(&self, step: Duration) {
        *self.now.lock() += step;
    }

    /// Advances the clock by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for ManualClock {
    fn elapsed(&self) -> Duration {
        *self.now.lock()
    }
}
