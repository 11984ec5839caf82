//! Tokio-driven session loop.
//!
//! The coordinator's per-cycle update is synchronous and suspension-free; this
//! module supplies the scheduler that calls it. [`SessionRunner`] ticks at the
//! configured cycle interval, invokes [`Coordinator::runtime_cycle`] once per tick,
//! and exits when the session terminates, either through the coordinator's own
//! logic (operator command, sequence exhaustion, fatal error) or through a
//! [`StopHandle`] held by orchestration code.

use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::coordinator::Coordinator;
use crate::error::CoordinatorResult;

/// Handle that requests a graceful stop of a running session loop.
#[derive(Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Requests termination. The loop finishes its current cycle first.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Drives a [`Coordinator`] at its configured cycle interval until termination.
pub struct SessionRunner {
    coordinator: Coordinator,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl SessionRunner {
    /// Wraps a coordinator in a runnable session loop.
    pub fn new(coordinator: Coordinator) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            coordinator,
            stop_tx,
            stop_rx,
        }
    }

    /// Returns a handle that can stop the loop from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Access to the wrapped coordinator.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Consumes the runner, returning the coordinator.
    pub fn into_coordinator(self) -> Coordinator {
        self.coordinator
    }

    /// Runs cycles until the session terminates.
    ///
    /// Missed ticks are skipped rather than bursted: the loop is soft real-time
    /// and a late cycle reads fresher hardware state anyway.
    pub async fn run(&mut self) -> CoordinatorResult<()> {
        let period = Duration::from_millis(self.coordinator.options().cycle_interval_ms.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.coordinator.runtime_cycle()?;
                    if self.coordinator.terminated() {
                        return Ok(());
                    }
                }
                changed = self.stop_rx.changed() => {
                    // A dropped sender can only be our own clone; treat it as
                    // a stop request either way.
                    let _ = changed;
                    self.coordinator.stop()?;
                    return Ok(());
                }
            }
        }
    }
}
