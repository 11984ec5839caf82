//! Live visualizer adapter.
//!
//! The visualizer renders animal behavior for the operator; its cadence and drawing
//! are its own concern and never feed back into the control loop. The coordinator
//! pushes two classes of updates through [`VisualizerSink`]: discrete events (licks,
//! valve activations, puffs, trial outcomes), forwarded immediately, and scalar
//! metrics (running speed, training thresholds), which [`VisualizerAdapter`] bounds
//! to a minimum interval so a fast control loop cannot flood a slow renderer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::TrialKind;

/// Sink for visualizer updates. Infallible by design: a broken visualizer must
/// never take the session down with it.
pub trait VisualizerSink: Send {
    /// A lick was detected.
    fn lick_event(&mut self);

    /// The water valve was activated.
    fn valve_event(&mut self);

    /// A gas puff was triggered.
    fn puff_event(&mut self);

    /// A trial finished with the given outcome.
    fn trial_outcome(&mut self, kind: TrialKind, succeeded: bool, guided: bool);

    /// New running-speed estimate, in cm/s.
    fn running_speed(&mut self, cm_s: f64);

    /// New training thresholds (speed in cm/s, sustained duration).
    fn thresholds(&mut self, speed_cm_s: f64, duration: Duration);
}

/// Rate-bounding wrapper around a [`VisualizerSink`].
///
/// Events pass through untouched. Scalar updates are dropped unless at least the
/// configured minimum interval has elapsed since the previous accepted scalar,
/// judged against the monotonic timestamps the coordinator supplies.
pub struct VisualizerAdapter {
    sink: Box<dyn VisualizerSink>,
    min_interval: Duration,
    last_scalar_at: Option<Duration>,
}

impl VisualizerAdapter {
    /// Wraps `sink`, limiting scalar updates to one per `min_interval`.
    pub fn new(sink: Box<dyn VisualizerSink>, min_interval: Duration) -> Self {
        Self {
            sink,
            min_interval,
            last_scalar_at: None,
        }
    }

    /// Forwards a lick event.
    pub fn lick_event(&mut self) {
        self.sink.lick_event();
    }

    /// Forwards a valve event.
    pub fn valve_event(&mut self) {
        self.sink.valve_event();
    }

    /// Forwards a puff event.
    pub fn puff_event(&mut self) {
        self.sink.puff_event();
    }

    /// Forwards a trial outcome.
    pub fn trial_outcome(&mut self, kind: TrialKind, succeeded: bool, guided: bool) {
        self.sink.trial_outcome(kind, succeeded, guided);
    }

    /// Forwards a running-speed update if the rate bound allows it.
    pub fn running_speed(&mut self, now: Duration, cm_s: f64) {
        if self.scalar_allowed(now) {
            self.sink.running_speed(cm_s);
        }
    }

    /// Forwards a threshold update, bypassing the rate bound.
    ///
    /// Threshold changes are operator actions and rare; dropping one would leave
    /// the display stale until the next adjustment.
    pub fn thresholds(&mut self, speed_cm_s: f64, duration: Duration) {
        self.sink.thresholds(speed_cm_s, duration);
    }

    fn scalar_allowed(&mut self, now: Duration) -> bool {
        let allowed = match self.last_scalar_at {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.min_interval,
        };
        if allowed {
            self.last_scalar_at = Some(now);
        }
        allowed
    }
}

/// Visualizer that discards everything. Used by headless runtimes.
#[derive(Default)]
pub struct NullVisualizer;

impl VisualizerSink for NullVisualizer {
    fn lick_event(&mut self) {}
    fn valve_event(&mut self) {}
    fn puff_event(&mut self) {}
    fn trial_outcome(&mut self, _kind: TrialKind, _succeeded: bool, _guided: bool) {}
    fn running_speed(&mut self, _cm_s: f64) {}
    fn thresholds(&mut self, _speed_cm_s: f64, _duration: Duration) {}
}

/// Recorded trial outcome entry of [`RecordingVisualizer`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutcomeEntry {
    /// Trial kind of the finished trial.
    pub kind: TrialKind,
    /// Whether the goal was met.
    pub succeeded: bool,
    /// Whether the trial ran in guidance mode.
    pub guided: bool,
}

/// Sink that records every update for test assertions.
#[derive(Clone, Default)]
pub struct RecordingVisualizer {
    inner: Arc<Mutex<RecordingState>>,
}

#[derive(Default)]
struct RecordingState {
    licks: u32,
    valves: u32,
    puffs: u32,
    outcomes: Vec<OutcomeEntry>,
    speeds: Vec<f64>,
    thresholds: Vec<(f64, Duration)>,
}

impl RecordingVisualizer {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lick events received.
    pub fn lick_events(&self) -> u32 {
        self.inner.lock().licks
    }

    /// Number of valve events received.
    pub fn valve_events(&self) -> u32 {
        self.inner.lock().valves
    }

    /// Number of puff events received.
    pub fn puff_events(&self) -> u32 {
        self.inner.lock().puffs
    }

    /// All recorded trial outcomes, in order.
    pub fn outcomes(&self) -> Vec<OutcomeEntry> {
        self.inner.lock().outcomes.clone()
    }

    /// All accepted running-speed updates, in order.
    pub fn speeds(&self) -> Vec<f64> {
        self.inner.lock().speeds.clone()
    }

    /// All threshold updates, in order.
    pub fn threshold_updates(&self) -> Vec<(f64, Duration)> {
        self.inner.lock().thresholds.clone()
    }
}

impl VisualizerSink for RecordingVisualizer {
    fn lick_event(&mut self) {
        self.inner.lock().licks += 1;
    }

    fn valve_event(&mut self) {
        self.inner.lock().valves += 1;
    }

    fn puff_event(&mut self) {
        self.inner.lock().puffs += 1;
    }

    fn trial_outcome(&mut self, kind: TrialKind, succeeded: bool, guided: bool) {
        self.inner.lock().outcomes.push(OutcomeEntry {
            kind,
            succeeded,
            guided,
        });
    }

    fn running_speed(&mut self, cm_s: f64) {
        self.inner.lock().speeds.push(cm_s);
    }

    fn thresholds(&mut self, speed_cm_s: f64, duration: Duration) {
        self.inner.lock().thresholds.push((speed_cm_s, duration));
    }
}
