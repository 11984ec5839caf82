//! Session state, system states, and session descriptors.
//!
//! The coordinator owns exactly one [`SessionState`] value per active session and is
//! its only writer. The state captures everything the per-cycle update mutates:
//! system and runtime states, pause/termination flags, time accounting, and the
//! behavioral counters. Redesigned away from the historical god-object shape,
//! hardware and transport handles live outside this type as injected capabilities.
//!
//! [`SessionDescriptor`] is the summary persisted through a [`DescriptorStore`]
//! when a session ends: normal termination marks it `Complete` with final counters,
//! error termination marks it `Aborted` with the fatal reason.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Top-level states of the session coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemState {
    /// Not conducting a session stage; brake engaged, screens off, sensors muted.
    Idle,
    /// Rest period of an experiment session.
    Rest,
    /// Run period of an experiment session (VR task active).
    Run,
    /// Lick training session.
    LickTraining,
    /// Run training session.
    RunTraining,
}

impl SystemState {
    /// Numeric code used in log records.
    pub fn code(&self) -> u8 {
        match self {
            SystemState::Idle => 0,
            SystemState::Rest => 1,
            SystemState::Run => 2,
            SystemState::LickTraining => 3,
            SystemState::RunTraining => 4,
        }
    }

    /// Whether the transition table permits moving to `to` given the session's
    /// termination status.
    ///
    /// Any state may transition to any other while the session is live; after
    /// termination, `Idle` is the only reachable state.
    pub fn can_transition(self, to: SystemState, terminated: bool) -> bool {
        if terminated {
            to == SystemState::Idle
        } else {
            true
        }
    }
}

/// Runtime (task stage) code used while a non-idle state is active.
pub const RUNTIME_STATE_IDLE: u8 = 0;
/// Runtime code for active training stages.
pub const RUNTIME_STATE_TRAINING: u8 = 255;

/// Mutable state of one active session. Owned and mutated exclusively by the
/// coordinator's control loop.
#[derive(Clone, Debug)]
pub struct SessionState {
    /// Current system state.
    pub system_state: SystemState,
    /// Current sub-runtime (task stage) code.
    pub runtime_state: u8,
    /// Whether logical time is currently frozen.
    pub paused: bool,
    /// Whether the session has terminated. Monotonic: once set, never cleared.
    pub terminated: bool,
    /// Logical elapsed session time (wall time minus accumulated pauses).
    pub elapsed: Duration,
    /// Total time spent paused.
    pub paused_time: Duration,
    /// Cumulative distance traveled, in centimeters.
    pub distance_cm: f64,
    /// Absolute VR track position.
    pub position: f64,
    /// Cumulative lick count.
    pub lick_count: u64,
    /// Water volume delivered while the session was active, in microliters.
    pub delivered_volume_ul: f64,
    /// Water volume delivered while paused; never counted against the session.
    pub paused_volume_ul: f64,
    /// Rewards delivered but not yet consumed by a lick.
    pub unconsumed_rewards: u32,
    /// Cumulative imaging frame count.
    pub frame_count: u64,
    /// Whether the imaging subsystem stopped producing frames.
    pub imaging_terminated: bool,
    /// Windowed running-speed estimate, in cm/s.
    pub running_speed_cm_s: f64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            system_state: SystemState::Idle,
            runtime_state: RUNTIME_STATE_IDLE,
            paused: false,
            terminated: false,
            elapsed: Duration::ZERO,
            paused_time: Duration::ZERO,
            distance_cm: 0.0,
            position: 0.0,
            lick_count: 0,
            delivered_volume_ul: 0.0,
            paused_volume_ul: 0.0,
            unconsumed_rewards: 0,
            frame_count: 0,
            imaging_terminated: false,
            running_speed_cm_s: 0.0,
        }
    }
}

impl SessionState {
    /// Fresh state for a new session, starting in `Idle`.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Final disposition of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The session ran to a normal termination.
    Complete,
    /// The session was cut short by an error or operator abort.
    Aborted {
        /// Human-readable description of what ended the session.
        reason: String,
    },
}

/// Summary descriptor persisted when a session ends.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Unique session identifier.
    pub uid: Uuid,
    /// Animal or subject identifier supplied by the orchestration layer.
    pub subject: String,
    /// UTC time the session started.
    pub started_at: DateTime<Utc>,
    /// UTC time the session ended, once known.
    pub ended_at: Option<DateTime<Utc>>,
    /// Final disposition.
    pub outcome: SessionOutcome,
    /// Total trials finished.
    pub completed_trials: u32,
    /// Reward-kind trials finished in guidance mode.
    pub guided_reward_trials: u32,
    /// Aversive-kind trials finished in guidance mode.
    pub guided_aversive_trials: u32,
    /// Cumulative distance traveled, in centimeters.
    pub distance_cm: f64,
    /// Total licks recorded.
    pub lick_count: u64,
    /// Water delivered during active runtime, in microliters.
    pub delivered_volume_ul: f64,
    /// Water delivered while paused, in microliters.
    pub paused_volume_ul: f64,
    /// Total time spent paused, in seconds.
    pub paused_seconds: f64,
}

impl SessionDescriptor {
    /// Creates a descriptor for a session starting now.
    pub fn new(subject: &str) -> Self {
        Self {
            uid: Uuid::new_v4(),
            subject: subject.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: SessionOutcome::Complete,
            completed_trials: 0,
            guided_reward_trials: 0,
            guided_aversive_trials: 0,
            distance_cm: 0.0,
            lick_count: 0,
            delivered_volume_ul: 0.0,
            paused_volume_ul: 0.0,
            paused_seconds: 0.0,
        }
    }

    /// Fills the final counters from the session state.
    pub fn finalize(&mut self, state: &SessionState, outcome: SessionOutcome) {
        self.ended_at = Some(Utc::now());
        self.outcome = outcome;
        self.distance_cm = state.distance_cm;
        self.lick_count = state.lick_count;
        self.delivered_volume_ul = state.delivered_volume_ul;
        self.paused_volume_ul = state.paused_volume_ul;
        self.paused_seconds = state.paused_time.as_secs_f64();
    }
}

/// Snapshot of observable hardware state, flushed to the data log at termination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    /// Cumulative valve pulse count.
    pub valve_pulses: u64,
    /// Cumulative puff count.
    pub puff_count: u64,
    /// Cumulative lick count.
    pub lick_count: u64,
    /// Cumulative imaging frame count.
    pub frame_count: u64,
    /// Cumulative encoder distance, in centimeters.
    pub distance_cm: f64,
}

/// External collaborator that persists session descriptors.
pub trait DescriptorStore: Send {
    /// Persists the final descriptor. Failures surface as descriptor errors but
    /// never interrupt the hardware-safing part of termination.
    fn persist(&mut self, descriptor: &SessionDescriptor) -> CoordinatorResult<()>;
}

/// Store that writes the descriptor as pretty-printed JSON to a file.
pub struct JsonDescriptorStore {
    path: PathBuf,
}

impl JsonDescriptorStore {
    /// Creates a store writing to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DescriptorStore for JsonDescriptorStore {
    fn persist(&mut self, descriptor: &SessionDescriptor) -> CoordinatorResult<()> {
        let serialized = serde_json::to_vec_pretty(descriptor)
            .map_err(|e| CoordinatorError::Descriptor(e.to_string()))?;
        std::fs::write(&self.path, serialized)?;
        Ok(())
    }
}

/// In-memory store used by tests.
#[derive(Clone, Default)]
pub struct MemoryDescriptorStore {
    persisted: std::sync::Arc<parking_lot::Mutex<Vec<SessionDescriptor>>>,
}

impl MemoryDescriptorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All descriptors persisted so far.
    pub fn persisted(&self) -> Vec<SessionDescriptor> {
        self.persisted.lock().clone()
    }
}

impl DescriptorStore for MemoryDescriptorStore {
    fn persist(&mut self, descriptor: &SessionDescriptor) -> CoordinatorResult<()> {
        self.persisted.lock().push(descriptor.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_after_termination() {
        for state in [
            SystemState::Idle,
            SystemState::Rest,
            SystemState::Run,
            SystemState::LickTraining,
            SystemState::RunTraining,
        ] {
            assert!(state.can_transition(SystemState::Idle, true));
            assert!(!state.can_transition(SystemState::Run, true));
            assert!(state.can_transition(SystemState::Run, false));
        }
    }

    #[test]
    fn test_state_codes_match_log_encoding() {
        assert_eq!(SystemState::Idle.code(), 0);
        assert_eq!(SystemState::RunTraining.code(), 4);
    }

    #[test]
    fn test_descriptor_finalize_copies_counters() {
        let mut state = SessionState::new();
        state.distance_cm = 1234.5;
        state.lick_count = 77;
        state.delivered_volume_ul = 150.0;
        state.paused_volume_ul = 10.0;
        state.paused_time = Duration::from_secs(12);

        let mut descriptor = SessionDescriptor::new("mouse-17");
        descriptor.finalize(&state, SessionOutcome::Complete);

        assert_eq!(descriptor.outcome, SessionOutcome::Complete);
        assert_eq!(descriptor.distance_cm, 1234.5);
        assert_eq!(descriptor.lick_count, 77);
        assert_eq!(descriptor.paused_seconds, 12.0);
        assert!(descriptor.ended_at.is_some());
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let mut store = JsonDescriptorStore::new(path.clone());
        let mut descriptor = SessionDescriptor::new("mouse-3");
        descriptor.finalize(
            &SessionState::new(),
            SessionOutcome::Aborted {
                reason: "imaging stale".to_string(),
            },
        );
        store.persist(&descriptor).unwrap();

        let raw = std::fs::read(&path).unwrap();
        let loaded: SessionDescriptor = serde_json::from_slice(&raw).unwrap();
        assert_eq!(loaded.uid, descriptor.uid);
        assert!(matches!(loaded.outcome, SessionOutcome::Aborted { .. }));
    }
}
