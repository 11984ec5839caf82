//! Trial progression and adaptive guidance policy.
//!
//! Once the cue sequence is decomposed, the session becomes an ordered list of
//! planned trials, each with a physical distance and an outcome structure. This
//! module tracks progression through that list and applies the adaptive guidance
//! logic: two independent instances of the same [`GuidanceController`] state
//! machine, one per [`TrialKind`], decide whether a trial's outcome is earned by
//! the animal or force-set by the system.
//!
//! Guidance follows a hysteresis pattern. A controller may start enabled for a
//! configured number of initial trials. Once disabled, a run of consecutive
//! unguided failures reaching the recovery threshold re-enables it for a bounded
//! number of recovery trials, after which it disengages again unless failures
//! recur. Re-enabling guidance always clears the failure streak, and guided-trial
//! counters only move while guidance is enabled.

use std::time::Duration;

use crate::config::{GuidanceSettings, TrialKind, TrialStructure};
use crate::motif::TrialBoundary;

/// One trial slot in the session plan.
#[derive(Clone, Debug)]
pub struct PlannedTrial {
    /// Registration index of the motif this trial was matched from.
    pub motif: usize,
    /// Behavioral kind of the trial.
    pub kind: TrialKind,
    /// Distance the animal must travel to finish the trial, in centimeters.
    pub distance_cm: f64,
    /// Water volume on success, in microliters (reward trials).
    pub reward_volume_ul: f64,
    /// Reward tone duration, in milliseconds (reward trials).
    pub reward_tone_ms: u64,
    /// Probability that an earned reward is actually released.
    pub reward_probability: f64,
    /// Puff duration, in milliseconds (aversive trials).
    pub puff_duration_ms: u64,
}

/// Per-kind trial counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KindCounters {
    /// Trials of this kind finished, regardless of outcome.
    pub completed: u32,
    /// Trials finished while guidance was enabled.
    pub guided: u32,
    /// Unguided trials whose goal was not met.
    pub failed: u32,
}

/// Adaptive guidance state machine for one trial kind.
#[derive(Clone, Debug)]
pub struct GuidanceController {
    settings: GuidanceSettings,
    enabled: bool,
    /// Remaining guided-trial budget. `None` means guidance was forced on by the
    /// operator and stays on until forced off.
    budget: Option<u32>,
    failure_streak: u32,
    counters: KindCounters,
    last_succeeded: bool,
}

impl GuidanceController {
    /// Creates a controller, arming the initial guided-trial budget if configured.
    pub fn new(settings: GuidanceSettings) -> Self {
        let enabled = settings.initial_guided_trials > 0;
        Self {
            settings,
            enabled,
            budget: enabled.then_some(settings.initial_guided_trials),
            failure_streak: 0,
            counters: KindCounters::default(),
            last_succeeded: false,
        }
    }

    /// Whether guidance is currently enabled for this kind.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the most recently finished trial of this kind met its goal.
    pub fn last_succeeded(&self) -> bool {
        self.last_succeeded
    }

    /// Per-kind counters.
    pub fn counters(&self) -> KindCounters {
        self.counters
    }

    /// Current consecutive unguided-failure streak.
    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    /// Operator override: enable guidance with no budget.
    pub fn force_enable(&mut self) {
        self.enabled = true;
        self.budget = None;
        // Entering guidance always clears the recovery bookkeeping.
        self.failure_streak = 0;
    }

    /// Operator override: disable guidance.
    pub fn force_disable(&mut self) {
        self.enabled = false;
        self.budget = None;
    }

    /// Resolves one finished trial of this kind.
    ///
    /// `goal_met` reports the animal's own performance; it is ignored while
    /// guidance is enabled, in which case the trial is classified guided and its
    /// outcome force-set to success. Returns `(succeeded, guided)`.
    pub fn resolve_trial(&mut self, goal_met: bool) -> (bool, bool) {
        self.counters.completed += 1;

        if self.enabled {
            self.counters.guided += 1;
            self.last_succeeded = true;
            if let Some(budget) = self.budget.as_mut() {
                *budget -= 1;
                if *budget == 0 {
                    self.enabled = false;
                    self.budget = None;
                }
            }
            return (true, true);
        }

        if goal_met {
            self.last_succeeded = true;
            self.failure_streak = 0;
            return (true, false);
        }

        self.last_succeeded = false;
        self.counters.failed += 1;
        self.failure_streak += 1;
        if self.failure_streak >= self.settings.recovery_threshold
            && self.settings.recovery_guided_trials > 0
        {
            self.enabled = true;
            self.budget = Some(self.settings.recovery_guided_trials);
            self.failure_streak = 0;
        }
        (false, false)
    }
}

/// Outcome of one finished trial, as resolved by [`TrialPolicy::advance_trial`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrialResolution {
    /// Kind of the finished trial.
    pub kind: TrialKind,
    /// Whether the trial counts as succeeded (force-set while guided).
    pub succeeded: bool,
    /// Whether the trial ran in guidance mode.
    pub guided: bool,
    /// Index of the next trial, or `None` when the sequence is exhausted.
    pub next: Option<usize>,
}

/// Progression state over the session's planned trial list.
pub struct TrialPolicy {
    trials: Vec<PlannedTrial>,
    current: usize,
    /// Transient per-trial flag: the active trial's goal has been met.
    goal_met: bool,
    reward_guidance: GuidanceController,
    aversive_guidance: GuidanceController,
}

fn build_plan(structures: &[TrialStructure], boundaries: &[TrialBoundary]) -> Vec<PlannedTrial> {
    boundaries
        .iter()
        .filter_map(|boundary| {
            structures.get(boundary.motif).map(|s| PlannedTrial {
                motif: boundary.motif,
                kind: s.kind,
                distance_cm: boundary.distance_cm,
                reward_volume_ul: s.reward_volume_ul,
                reward_tone_ms: s.reward_tone_ms,
                reward_probability: s.reward_probability,
                puff_duration_ms: s.puff_duration_ms,
            })
        })
        .collect()
}

impl TrialPolicy {
    /// Builds the session plan from decomposed boundaries and their structures.
    pub fn new(
        structures: &[TrialStructure],
        boundaries: &[TrialBoundary],
        reward_guidance: GuidanceSettings,
        aversive_guidance: GuidanceSettings,
    ) -> Self {
        Self {
            trials: build_plan(structures, boundaries),
            current: 0,
            goal_met: false,
            reward_guidance: GuidanceController::new(reward_guidance),
            aversive_guidance: GuidanceController::new(aversive_guidance),
        }
    }

    /// Replaces the trial plan after a cue-sequence reset, keeping the guidance
    /// controllers' adaptive state intact.
    pub fn reset_plan(&mut self, structures: &[TrialStructure], boundaries: &[TrialBoundary]) {
        self.trials = build_plan(structures, boundaries);
        self.current = 0;
        self.goal_met = false;
    }

    /// Total number of planned trials.
    pub fn trial_count(&self) -> usize {
        self.trials.len()
    }

    /// The full session plan, in execution order.
    pub fn planned(&self) -> &[PlannedTrial] {
        &self.trials
    }

    /// Index of the active trial, or `None` once the sequence is exhausted.
    pub fn current_index(&self) -> Option<usize> {
        (self.current < self.trials.len()).then_some(self.current)
    }

    /// The active trial's plan entry.
    pub fn current_trial(&self) -> Option<&PlannedTrial> {
        self.trials.get(self.current)
    }

    /// Kind of the active trial.
    pub fn current_kind(&self) -> Option<TrialKind> {
        self.current_trial().map(|t| t.kind)
    }

    /// Whether every planned trial has been consumed.
    pub fn exhausted(&self) -> bool {
        self.current >= self.trials.len()
    }

    /// Guidance controller for the given kind.
    pub fn guidance(&self, kind: TrialKind) -> &GuidanceController {
        match kind {
            TrialKind::Reward => &self.reward_guidance,
            TrialKind::Aversive => &self.aversive_guidance,
        }
    }

    /// Mutable guidance controller for the given kind.
    pub fn guidance_mut(&mut self, kind: TrialKind) -> &mut GuidanceController {
        match kind {
            TrialKind::Reward => &mut self.reward_guidance,
            TrialKind::Aversive => &mut self.aversive_guidance,
        }
    }

    /// Whether the active trial runs in guidance mode.
    pub fn current_trial_guided(&self) -> bool {
        match self.current_kind() {
            Some(kind) => self.guidance(kind).enabled(),
            None => false,
        }
    }

    /// Records that the active trial's goal has been met by the animal.
    pub fn mark_goal_met(&mut self) {
        if !self.exhausted() {
            self.goal_met = true;
        }
    }

    /// Whether the active trial's goal has already been met.
    pub fn goal_met(&self) -> bool {
        self.goal_met
    }

    /// True exactly when the distance accumulated since the last trial boundary
    /// reaches or exceeds the active trial's configured distance.
    ///
    /// A zero-distance trial therefore completes the instant it becomes active.
    /// Returns false once the sequence is exhausted.
    pub fn trial_completed(&self, distance_since_boundary: f64) -> bool {
        match self.current_trial() {
            Some(trial) => distance_since_boundary >= trial.distance_cm,
            None => false,
        }
    }

    /// Finishes the active trial, updates the per-kind counters and guidance
    /// state, resets the transient flags, and advances the trial pointer.
    ///
    /// `next` is `None` when the trial list is exhausted; the caller treats that
    /// as the session's terminal condition.
    pub fn advance_trial(&mut self) -> Option<TrialResolution> {
        let kind = self.current_kind()?;
        let goal_met = self.goal_met;

        let (succeeded, guided) = self.guidance_mut(kind).resolve_trial(goal_met);

        self.goal_met = false;
        self.current += 1;

        Some(TrialResolution {
            kind,
            succeeded,
            guided,
            next: self.current_index(),
        })
    }

    /// Reward parameters of the active trial: `(volume in microliters, tone
    /// duration)`. Returns zero values when the active trial is not a reward
    /// trial; guidance toggles act per kind, so asking for the other kind's
    /// parameters is routine, not an error.
    pub fn current_reward(&self) -> (f64, Duration) {
        match self.current_trial() {
            Some(trial) if trial.kind == TrialKind::Reward => (
                trial.reward_volume_ul,
                Duration::from_millis(trial.reward_tone_ms),
            ),
            _ => (0.0, Duration::ZERO),
        }
    }

    /// Puff duration of the active trial. Zero when the active trial is not
    /// aversive.
    pub fn current_puff(&self) -> Duration {
        match self.current_trial() {
            Some(trial) if trial.kind == TrialKind::Aversive => {
                Duration::from_millis(trial.puff_duration_ms)
            }
            _ => Duration::ZERO,
        }
    }
}
