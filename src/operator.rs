//! Operator command interface.
//!
//! The operator's control surface (GUI, keyboard listener, or remote console) runs
//! outside the coordinator. Once per cycle the UI step polls a snapshot of the
//! desired command state: latched toggles (pause, guidance overrides, marker
//! visibility), one-shot actions (manual reward, terminate), and the training
//! threshold modifiers. The coordinator also pushes a small amount of state back so
//! the control surface can mirror pauses and guidance changes it did not initiate.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TrialKind;

/// Snapshot of the operator's desired command state.
#[derive(Clone, Debug)]
pub struct OperatorCommands {
    /// Desired pause state (latched).
    pub pause: bool,
    /// Request to terminate the session (latched; termination is one-way).
    pub terminate: bool,
    /// One-shot manual reward request. Cleared by the poll that observes it.
    pub manual_reward: bool,
    /// Volume for manual rewards, in microliters.
    pub reward_volume_ul: f64,
    /// Operator override of reward-trial guidance, if any.
    pub reward_guidance: Option<bool>,
    /// Operator override of aversive-trial guidance, if any.
    pub aversive_guidance: Option<bool>,
    /// Desired visibility of the reward-zone boundary marker.
    pub show_reward_marker: bool,
    /// Training speed-threshold modifier, in 0.5 cm/s steps.
    pub speed_modifier: i32,
    /// Training duration-threshold modifier, in 50 ms steps.
    pub duration_modifier: i32,
}

impl Default for OperatorCommands {
    fn default() -> Self {
        Self {
            pause: false,
            terminate: false,
            manual_reward: false,
            reward_volume_ul: 5.0,
            reward_guidance: None,
            aversive_guidance: None,
            show_reward_marker: false,
            speed_modifier: 0,
            duration_modifier: 0,
        }
    }
}

/// Polled command source plus the reverse sync channel to the control surface.
pub trait OperatorInterface: Send {
    /// Returns the current command snapshot. One-shot commands observed by this
    /// poll must not be reported again by the next one.
    fn poll(&mut self) -> OperatorCommands;

    /// Mirrors a pause-state change back to the control surface.
    fn sync_pause(&mut self, _paused: bool) {}

    /// Mirrors a guidance-state change back to the control surface.
    fn sync_guidance(&mut self, _kind: TrialKind, _enabled: bool) {}
}

/// Scriptable operator used by tests and headless runs.
#[derive(Clone, Default)]
pub struct MockOperator {
    inner: Arc<Mutex<MockOperatorState>>,
}

#[derive(Default)]
struct MockOperatorState {
    commands: OperatorCommands,
    pause_syncs: Vec<bool>,
    guidance_syncs: Vec<(TrialKind, bool)>,
}

impl MockOperator {
    /// Creates an operator issuing no commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the desired pause state.
    pub fn set_pause(&self, pause: bool) {
        self.inner.lock().commands.pause = pause;
    }

    /// Requests session termination.
    pub fn request_terminate(&self) {
        self.inner.lock().commands.terminate = true;
    }

    /// Queues one manual reward of the given volume.
    pub fn request_manual_reward(&self, volume_ul: f64) {
        let mut state = self.inner.lock();
        state.commands.manual_reward = true;
        state.commands.reward_volume_ul = volume_ul;
    }

    /// Sets a guidance override for the given kind.
    pub fn override_guidance(&self, kind: TrialKind, enabled: bool) {
        let mut state = self.inner.lock();
        match kind {
            TrialKind::Reward => state.commands.reward_guidance = Some(enabled),
            TrialKind::Aversive => state.commands.aversive_guidance = Some(enabled),
        }
    }

    /// Sets the training threshold modifiers.
    pub fn set_modifiers(&self, speed: i32, duration: i32) {
        let mut state = self.inner.lock();
        state.commands.speed_modifier = speed;
        state.commands.duration_modifier = duration;
    }

    /// Sets the reward-zone marker visibility.
    pub fn set_marker(&self, shown: bool) {
        self.inner.lock().commands.show_reward_marker = shown;
    }

    /// Pause states the coordinator mirrored back.
    pub fn pause_syncs(&self) -> Vec<bool> {
        self.inner.lock().pause_syncs.clone()
    }

    /// Guidance states the coordinator mirrored back.
    pub fn guidance_syncs(&self) -> Vec<(TrialKind, bool)> {
        self.inner.lock().guidance_syncs.clone()
    }
}

impl OperatorInterface for MockOperator {
    fn poll(&mut self) -> OperatorCommands {
        let mut state = self.inner.lock();
        let snapshot = state.commands.clone();
        // Manual reward is a one-shot action.
        state.commands.manual_reward = false;
        snapshot
    }

    fn sync_pause(&mut self, paused: bool) {
        let mut state = self.inner.lock();
        state.commands.pause = paused;
        state.pause_syncs.push(paused);
    }

    fn sync_guidance(&mut self, kind: TrialKind, enabled: bool) {
        self.inner.lock().guidance_syncs.push((kind, enabled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_reward_is_one_shot() {
        let operator = MockOperator::new();
        operator.request_manual_reward(7.0);

        let mut polled: Box<dyn OperatorInterface> = Box::new(operator.clone());
        let first = polled.poll();
        assert!(first.manual_reward);
        assert_eq!(first.reward_volume_ul, 7.0);

        let second = polled.poll();
        assert!(!second.manual_reward);
    }

    #[test]
    fn test_pause_is_latched() {
        let operator = MockOperator::new();
        operator.set_pause(true);

        let mut polled: Box<dyn OperatorInterface> = Box::new(operator.clone());
        assert!(polled.poll().pause);
        assert!(polled.poll().pause);
    }

    #[test]
    fn test_sync_pause_updates_command_state() {
        let operator = MockOperator::new();
        let mut iface: Box<dyn OperatorInterface> = Box::new(operator.clone());

        iface.sync_pause(true);
        assert!(iface.poll().pause);
        assert_eq!(operator.pause_syncs(), vec![true]);
    }
}
