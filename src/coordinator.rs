//! The session state machine and per-cycle runtime update.
//!
//! [`Coordinator`] is the root of the runtime: it owns the session's mutable state,
//! holds every external collaborator behind a constructor-injected capability
//! interface, and advances the session one [`Coordinator::runtime_cycle`] call at a
//! time. A cycle runs five sub-steps in fixed order: hardware data sampling, the
//! VR transport drain, trial/reward policy evaluation, operator command handling,
//! and the imaging staleness watch. Termination is checked at the top of the cycle
//! and between steps, so a terminate request finishes the current sub-step and
//! never leaves a hardware command half-issued.
//!
//! Pausing freezes logical time: distance, speed, and staleness accounting all use
//! wall time minus the accumulated paused time, and reward or puff delivery is
//! suppressed, while raw hardware samples keep flowing to the data logger. All
//! fatal conditions funnel through the same termination path, which commands the
//! hardware to a safe state (valve quiet, brake engaged) before surfacing the
//! error.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::MonotonicClock;
use crate::config::{ExperimentConfiguration, RuntimeOptions, TrialKind};
use crate::datalog::{
    BehaviorSample, DataLogger, LogEventCode, LogRecord, TrialOutcomeRecord, COORDINATOR_SOURCE_ID,
};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::hardware::{ActuatorInterface, SignalChannels};
use crate::motif::MotifDecomposer;
use crate::operator::OperatorInterface;
use crate::policy::TrialPolicy;
use crate::session::{
    DescriptorStore, HardwareSnapshot, SessionDescriptor, SessionOutcome, SessionState,
    SystemState, RUNTIME_STATE_IDLE, RUNTIME_STATE_TRAINING,
};
use crate::transport::{CueSequencePayload, MovementPayload, TogglePayload, VrTopic, VrTransport};
use crate::visualizer::{VisualizerAdapter, VisualizerSink};

/// Tone duration used for training rewards and reward simulation.
const TRAINING_TONE: Duration = Duration::from_millis(300);

fn kind_code(kind: TrialKind) -> u8 {
    match kind {
        TrialKind::Reward => 0,
        TrialKind::Aversive => 1,
    }
}

fn kind_slot(kind: TrialKind) -> usize {
    kind_code(kind) as usize
}

/// External collaborators injected into the coordinator.
///
/// Every handle is a capability interface, so tests substitute mocks for all of
/// them and drive the control loop deterministically.
pub struct Collaborators {
    /// Monotonic time source.
    pub clock: Box<dyn MonotonicClock>,
    /// Hardware read channels.
    pub signals: SignalChannels,
    /// Hardware write commands.
    pub actuator: Box<dyn ActuatorInterface>,
    /// VR engine transport.
    pub transport: Box<dyn VrTransport>,
    /// Append-only session data log.
    pub logger: Box<dyn DataLogger>,
    /// Visualizer sink (wrapped in the rate-bounding adapter internally).
    pub visualizer: Box<dyn VisualizerSink>,
    /// Operator command source.
    pub operator: Box<dyn OperatorInterface>,
    /// Session descriptor persistence.
    pub descriptor_store: Box<dyn DescriptorStore>,
}

/// Soft real-time session coordinator for mesoscope-VR experiments.
pub struct Coordinator {
    config: ExperimentConfiguration,
    state: SessionState,
    descriptor: SessionDescriptor,

    clock: Box<dyn MonotonicClock>,
    signals: SignalChannels,
    actuator: Box<dyn ActuatorInterface>,
    transport: Box<dyn VrTransport>,
    logger: Box<dyn DataLogger>,
    visualizer: VisualizerAdapter,
    operator: Box<dyn OperatorInterface>,
    descriptor_store: Box<dyn DescriptorStore>,

    rng: StdRng,
    decomposer: MotifDecomposer,
    policy: Option<TrialPolicy>,
    cue_sequence: Vec<u8>,

    started: bool,
    vr_terminated: bool,

    /// Cumulative encoder distance at the last trial boundary.
    trial_start_distance: f64,
    /// Logical time at the start of the current speed window.
    window_origin: Duration,
    /// Cumulative distance at the start of the current speed window.
    window_distance: f64,

    pause_started_at: Duration,
    pre_pause_state: SystemState,
    pre_pause_runtime_state: u8,

    /// Last guidance state published per kind (reward, aversive).
    guidance_sent: [Option<bool>; 2],
    /// Last operator guidance override observed per kind.
    override_seen: [Option<bool>; 2],
    marker_shown: bool,
    modifiers: (i32, i32),

    imaging_armed: bool,
    last_frame_count: u64,
    last_frame_at: Duration,

    above_threshold_since: Option<Duration>,
    last_lick_reward_at: Option<Duration>,
    pending_training_lick: bool,
}

impl Coordinator {
    /// Creates a coordinator for `subject` with the given configuration and
    /// collaborators. Fails fast on configuration errors; the session does not
    /// start until [`Coordinator::start`] is called.
    pub fn new(
        subject: &str,
        config: ExperimentConfiguration,
        collaborators: Collaborators,
    ) -> CoordinatorResult<Self> {
        config.validate()?;

        let visualizer = VisualizerAdapter::new(
            collaborators.visualizer,
            Duration::from_millis(config.options.visualizer_interval_ms),
        );

        Ok(Self {
            descriptor: SessionDescriptor::new(subject),
            state: SessionState::new(),
            clock: collaborators.clock,
            signals: collaborators.signals,
            actuator: collaborators.actuator,
            transport: collaborators.transport,
            logger: collaborators.logger,
            visualizer,
            operator: collaborators.operator,
            descriptor_store: collaborators.descriptor_store,
            rng: StdRng::from_entropy(),
            decomposer: MotifDecomposer::new(),
            policy: None,
            cue_sequence: Vec::new(),
            started: false,
            vr_terminated: false,
            trial_start_distance: 0.0,
            window_origin: Duration::ZERO,
            window_distance: 0.0,
            pause_started_at: Duration::ZERO,
            pre_pause_state: SystemState::Idle,
            pre_pause_runtime_state: RUNTIME_STATE_IDLE,
            guidance_sent: [None, None],
            override_seen: [None, None],
            marker_shown: false,
            modifiers: (0, 0),
            imaging_armed: false,
            last_frame_count: 0,
            last_frame_at: Duration::ZERO,
            above_threshold_since: None,
            last_lick_reward_at: None,
            pending_training_lick: false,
            config,
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the session: announces it to the VR engine and, when the
    /// configuration defines trials, performs the cue-sequence handshake.
    pub fn start(&mut self) -> CoordinatorResult<()> {
        if self.started {
            return Ok(());
        }
        if let Err(err) = self.transport.publish(VrTopic::SessionStart, b"{}") {
            return Err(self.fail(err));
        }
        if !self.config.trials.is_empty() {
            if let Err(err) = self.fetch_cue_sequence() {
                return Err(self.fail(err));
            }
        }
        self.started = true;
        tracing::info!(subject = %self.descriptor.subject, uid = %self.descriptor.uid, "session started");
        Ok(())
    }

    /// Ends the session normally. Idempotent.
    pub fn stop(&mut self) -> CoordinatorResult<()> {
        self.terminate_with(None)
    }

    /// Terminates the runtime. Idempotent, and the only path back to `Idle`
    /// once engaged.
    pub fn terminate_runtime(&mut self) -> CoordinatorResult<()> {
        self.terminate_with(None)
    }

    // =========================================================================
    // Mode entry points
    // =========================================================================

    /// Switches to the idle state: screens off, brake engaged.
    pub fn idle(&mut self) -> CoordinatorResult<()> {
        self.transition(SystemState::Idle)
    }

    /// Switches to the rest state: screens off, brake engaged, licks monitored.
    pub fn rest(&mut self) -> CoordinatorResult<()> {
        self.transition(SystemState::Rest)
    }

    /// Switches to the run state: screens on, brake released, VR task active.
    pub fn run(&mut self) -> CoordinatorResult<()> {
        self.transition(SystemState::Run)
    }

    /// Switches to the lick training state.
    pub fn lick_train(&mut self) -> CoordinatorResult<()> {
        self.transition(SystemState::LickTraining)
    }

    /// Switches to the run training state.
    pub fn run_train(&mut self) -> CoordinatorResult<()> {
        self.transition(SystemState::RunTraining)
    }

    fn transition(&mut self, to: SystemState) -> CoordinatorResult<()> {
        let from = self.state.system_state;
        if !from.can_transition(to, self.state.terminated) {
            return Err(CoordinatorError::InvalidTransition { from, to });
        }

        let leaving_active = matches!(
            from,
            SystemState::Run | SystemState::LickTraining | SystemState::RunTraining
        );
        if leaving_active && from != to {
            self.teardown_active_state()?;
        }

        match to {
            SystemState::Idle => {
                self.state.runtime_state = RUNTIME_STATE_IDLE;
                self.actuator.set_screens(false)?;
                self.actuator.set_brake(true)?;
            }
            SystemState::Rest => {
                self.actuator.set_screens(false)?;
                self.actuator.set_brake(true)?;
            }
            SystemState::Run => {
                self.actuator.set_screens(true)?;
                self.actuator.set_brake(false)?;
                if self.config.options.require_imaging && !self.imaging_armed {
                    self.imaging_armed = true;
                    self.last_frame_count = self.state.frame_count;
                    self.last_frame_at = self.logical_now();
                }
            }
            SystemState::LickTraining => {
                self.state.runtime_state = RUNTIME_STATE_TRAINING;
                self.actuator.set_screens(false)?;
                self.actuator.set_brake(true)?;
            }
            SystemState::RunTraining => {
                self.state.runtime_state = RUNTIME_STATE_TRAINING;
                self.actuator.set_screens(false)?;
                self.actuator.set_brake(false)?;
            }
        }

        self.state.system_state = to;
        self.log(LogEventCode::SystemState, &[to.code()]);
        self.log(LogEventCode::RuntimeState, &[self.state.runtime_state]);
        tracing::info!(?from, ?to, "system state changed");
        Ok(())
    }

    /// Clears the VR-side guidance flags when leaving an active task state.
    fn teardown_active_state(&mut self) -> CoordinatorResult<()> {
        for (slot, kind) in [(0, TrialKind::Reward), (1, TrialKind::Aversive)] {
            if self.guidance_sent[slot] == Some(true) {
                let payload = serde_json::to_vec(&TogglePayload { enabled: false })?;
                self.transport.publish(VrTopic::guidance_for(kind), &payload)?;
                self.log(LogEventCode::GuidanceState, &[kind_code(kind), 0]);
                self.guidance_sent[slot] = Some(false);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Per-cycle update
    // =========================================================================

    /// Runs one cycle of the runtime. Called once per scheduler tick.
    ///
    /// After termination this becomes a no-op; no further cycle executes.
    pub fn runtime_cycle(&mut self) -> CoordinatorResult<()> {
        if self.state.terminated {
            return Ok(());
        }
        self.state.elapsed = self.logical_now();

        if let Err(err) = self.data_cycle() {
            return Err(self.fail(err));
        }
        if self.state.terminated {
            return Ok(());
        }
        if let Err(err) = self.vr_cycle() {
            return Err(self.fail(err));
        }
        if self.state.terminated {
            return Ok(());
        }
        if let Err(err) = self.policy_cycle() {
            return Err(self.fail(err));
        }
        if self.state.terminated {
            return Ok(());
        }
        if let Err(err) = self.ui_cycle() {
            return Err(self.fail(err));
        }
        if self.state.terminated {
            return Ok(());
        }
        if let Err(err) = self.imaging_cycle() {
            return Err(self.fail(err));
        }
        Ok(())
    }

    /// Step 1: sample all hardware read channels and update derived state.
    fn data_cycle(&mut self) -> CoordinatorResult<()> {
        let distance = self.signals.encoder.distance_cm()?;
        let position = self.signals.encoder.position()?;
        let licks = self.signals.licks.count()?;
        let valve_pulses = self.signals.valve_pulses.count()?;
        let puffs = self.signals.puffs.count()?;
        let frames = self.signals.imaging_frames.count()?;

        self.state.frame_count = frames;

        if !self.state.paused {
            let now = self.logical_now();
            let window = now.saturating_sub(self.window_origin);
            if window >= self.config.options.speed_window() {
                let speed = (distance - self.window_distance) / window.as_secs_f64();
                self.state.running_speed_cm_s = speed;
                self.window_origin = now;
                self.window_distance = distance;
                self.visualizer.running_speed(self.clock.elapsed(), speed);
            }

            if self.state.system_state == SystemState::Run {
                let delta = position - self.state.position;
                if delta != 0.0 {
                    let payload = serde_json::to_vec(&MovementPayload { movement: delta })?;
                    self.transport.publish(VrTopic::Movement, &payload)?;
                }
            }
            self.state.distance_cm = distance;
            self.state.position = position;
        }

        // Licks are raw events; they are tracked even while paused so manual
        // rewards given during a pause still register as consumed.
        if licks > self.state.lick_count {
            self.state.lick_count = licks;
            self.state.unconsumed_rewards = 0;
            self.visualizer.lick_event();
            if !self.state.paused {
                if self.state.system_state == SystemState::Run {
                    self.transport.publish(VrTopic::Lick, &[])?;
                }
                if self.state.system_state == SystemState::LickTraining {
                    self.pending_training_lick = true;
                }
            }
        }

        let sample = BehaviorSample {
            distance_cm: distance,
            position,
            lick_count: licks,
            valve_pulses,
            puff_count: puffs,
            frame_count: frames,
            running_speed_cm_s: self.state.running_speed_cm_s,
        };
        let body = serde_json::to_vec(&sample)?;
        self.log(LogEventCode::Sample, &body);
        Ok(())
    }

    /// Step 2: drain pending VR engine messages.
    fn vr_cycle(&mut self) -> CoordinatorResult<()> {
        while let Some(message) = self.transport.try_recv() {
            match message.topic {
                VrTopic::RewardZoneEntry => {
                    if !self.state.paused {
                        if let Some(policy) = self.policy.as_mut() {
                            policy.mark_goal_met();
                        }
                    }
                }
                VrTopic::SessionStop => {
                    self.vr_terminated = true;
                    // Snapshot the traveled distance so post-processing can fuse
                    // cue sequences across an engine restart.
                    let distance = self.signals.encoder.distance_cm()?;
                    let body = serde_json::to_vec(&serde_json::json!({ "distance_cm": distance }))?;
                    self.log(LogEventCode::DistanceSnapshot, &body);
                    tracing::error!("VR engine terminated its session; pausing runtime");
                    self.pause_runtime()?;
                }
                // Cue sequences outside the handshake and unknown topics are
                // discarded.
                _ => {}
            }
            if self.state.terminated {
                break;
            }
        }
        Ok(())
    }

    /// Step 3: evaluate the trial/reward policy for the active mode.
    fn policy_cycle(&mut self) -> CoordinatorResult<()> {
        if self.state.paused {
            return Ok(());
        }
        match self.state.system_state {
            SystemState::Run => self.evaluate_trials(),
            SystemState::RunTraining => self.evaluate_run_training(),
            SystemState::LickTraining => self.evaluate_lick_training(),
            _ => Ok(()),
        }
    }

    fn evaluate_trials(&mut self) -> CoordinatorResult<()> {
        loop {
            let since = self.state.distance_cm - self.trial_start_distance;

            let decision = match self.policy.as_ref() {
                Some(policy) if policy.trial_completed(since) => {
                    policy.current_trial().map(|trial| {
                        (
                            trial.kind,
                            policy.current_trial_guided(),
                            policy.goal_met(),
                            policy.current_reward(),
                            policy.current_puff(),
                            trial.reward_probability,
                            trial.distance_cm,
                        )
                    })
                }
                _ => None,
            };
            let Some((kind, guided, goal_met, (volume, tone), puff, probability, trial_distance)) =
                decision
            else {
                break;
            };

            let succeeded = guided || goal_met;
            match kind {
                TrialKind::Reward => {
                    if succeeded {
                        let release =
                            guided || probability >= 1.0 || self.rng.gen::<f64>() < probability;
                        if release {
                            self.resolve_reward(volume, tone)?;
                        }
                    }
                }
                TrialKind::Aversive => {
                    if !succeeded {
                        self.actuator.trigger_puff(puff)?;
                        self.visualizer.puff_event();
                    }
                }
            }

            let resolution = match self.policy.as_mut() {
                Some(policy) => policy.advance_trial(),
                None => None,
            };
            let Some(resolution) = resolution else { break };

            self.trial_start_distance += trial_distance;

            self.visualizer
                .trial_outcome(resolution.kind, resolution.succeeded, resolution.guided);
            let finished_index = resolution.next.unwrap_or_else(|| {
                self.policy.as_ref().map(|p| p.trial_count()).unwrap_or(0)
            });
            let record = TrialOutcomeRecord {
                index: finished_index.saturating_sub(1),
                kind: resolution.kind,
                succeeded: resolution.succeeded,
                guided: resolution.guided,
            };
            let body = serde_json::to_vec(&record)?;
            self.log(LogEventCode::TrialOutcome, &body);
            self.sync_guidance()?;

            if resolution.next.is_none() {
                // Exhausting the planned sequence is the defined terminal
                // condition, not an error.
                tracing::info!("trial sequence exhausted; ending session");
                self.terminate_with(None)?;
                return Ok(());
            }
        }
        Ok(())
    }

    fn evaluate_run_training(&mut self) -> CoordinatorResult<()> {
        let speed_threshold = self.effective_speed_threshold();
        let duration_threshold = self.effective_duration_threshold();
        let now = self.logical_now();

        if self.state.running_speed_cm_s >= speed_threshold {
            let since = *self.above_threshold_since.get_or_insert(now);
            if now.saturating_sub(since) >= duration_threshold {
                let volume = self.config.options.training_reward_volume_ul;
                self.resolve_reward(volume, TRAINING_TONE)?;
                // A new epoch starts from scratch after every reward.
                self.above_threshold_since = None;
            }
        } else {
            self.above_threshold_since = None;
        }
        Ok(())
    }

    fn evaluate_lick_training(&mut self) -> CoordinatorResult<()> {
        if !self.pending_training_lick {
            return Ok(());
        }
        self.pending_training_lick = false;

        let now = self.logical_now();
        let cooldown = Duration::from_millis(self.config.options.lick_cooldown_ms);
        let ready = match self.last_lick_reward_at {
            None => true,
            Some(at) => now.saturating_sub(at) >= cooldown,
        };
        if ready {
            let volume = self.config.options.training_reward_volume_ul;
            self.resolve_reward(volume, TRAINING_TONE)?;
            self.last_lick_reward_at = Some(now);
        }
        Ok(())
    }

    /// Step 4: poll and apply operator commands.
    fn ui_cycle(&mut self) -> CoordinatorResult<()> {
        let commands = self.operator.poll();

        if commands.terminate {
            self.terminate_with(None)?;
            return Ok(());
        }

        if commands.pause && !self.state.paused {
            self.pause_runtime()?;
        } else if !commands.pause && self.state.paused {
            self.resume_runtime()?;
        }

        if commands.manual_reward {
            // Manual rewards bypass the unconsumed-reward gate.
            self.deliver_reward(commands.reward_volume_ul)?;
            if self.state.paused {
                self.state.unconsumed_rewards = 0;
            }
        }

        for (slot, kind, desired) in [
            (0, TrialKind::Reward, commands.reward_guidance),
            (1, TrialKind::Aversive, commands.aversive_guidance),
        ] {
            if desired != self.override_seen[slot] {
                self.override_seen[slot] = desired;
                if let (Some(enabled), Some(policy)) = (desired, self.policy.as_mut()) {
                    if enabled {
                        policy.guidance_mut(kind).force_enable();
                    } else {
                        policy.guidance_mut(kind).force_disable();
                    }
                }
            }
        }
        // While paused the VR-side flags stay in their torn-down state; the
        // first cycle after resume republishes them.
        if !self.state.paused {
            self.sync_guidance()?;
        }

        if commands.show_reward_marker != self.marker_shown {
            self.marker_shown = commands.show_reward_marker;
            let payload = serde_json::to_vec(&TogglePayload {
                enabled: self.marker_shown,
            })?;
            self.transport.publish(VrTopic::RewardZoneMarker, &payload)?;
            self.log(LogEventCode::RewardZoneMarker, &[u8::from(self.marker_shown)]);
        }

        let modifiers = (commands.speed_modifier, commands.duration_modifier);
        if modifiers != self.modifiers {
            self.modifiers = modifiers;
            let speed = self.effective_speed_threshold();
            let duration = self.effective_duration_threshold();
            self.visualizer.thresholds(speed, duration);
        }
        Ok(())
    }

    /// Step 5: watch imaging frame progress for staleness.
    fn imaging_cycle(&mut self) -> CoordinatorResult<()> {
        if !self.imaging_armed || self.state.paused || self.state.imaging_terminated {
            return Ok(());
        }
        let now = self.logical_now();

        if self.state.frame_count > self.last_frame_count {
            self.last_frame_count = self.state.frame_count;
            self.last_frame_at = now;
            return Ok(());
        }

        let gap = now.saturating_sub(self.last_frame_at);
        if gap > self.config.options.mesoscope_frame_delay() {
            self.state.imaging_terminated = true;
            return Err(CoordinatorError::ImagingStale {
                elapsed_ms: gap.as_millis() as u64,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Pause / resume / terminate
    // =========================================================================

    /// Pauses the runtime: logical time freezes, hardware switches to the idle
    /// state, and reward delivery is suppressed while raw logging continues.
    pub fn pause_runtime(&mut self) -> CoordinatorResult<()> {
        if self.state.paused || self.state.terminated {
            return Ok(());
        }
        self.pause_started_at = self.clock.elapsed();
        self.pre_pause_state = self.state.system_state;
        self.pre_pause_runtime_state = self.state.runtime_state;
        self.operator.sync_pause(true);
        self.idle()?;
        self.state.paused = true;
        tracing::warn!("session runtime paused");
        Ok(())
    }

    /// Resumes the runtime, restoring the pre-pause system state and discounting
    /// the paused interval from all duration-based accounting.
    pub fn resume_runtime(&mut self) -> CoordinatorResult<()> {
        if !self.state.paused || self.state.terminated {
            return Ok(());
        }

        let pause_span = self.clock.elapsed().saturating_sub(self.pause_started_at);
        self.state.paused_time += pause_span;
        self.state.paused = false;

        if self.vr_terminated {
            // An engine restart resets the wall-cue sequence; re-query it so
            // position tracking stays aligned with the new scene.
            self.fetch_cue_sequence()?;
            self.vr_terminated = false;
        }

        // Distance accumulated while paused does not count toward trials.
        let distance = self.signals.encoder.distance_cm()?;
        let position = self.signals.encoder.position()?;
        let paused_delta = distance - self.state.distance_cm;
        if paused_delta != 0.0 {
            self.trial_start_distance += paused_delta;
        }
        self.state.distance_cm = distance;
        self.state.position = position;
        self.window_origin = self.logical_now();
        self.window_distance = distance;
        self.above_threshold_since = None;

        match self.pre_pause_state {
            SystemState::Idle => self.idle()?,
            SystemState::Rest => self.rest()?,
            SystemState::Run => self.run()?,
            SystemState::LickTraining => self.lick_train()?,
            SystemState::RunTraining => self.run_train()?,
        }
        self.state.runtime_state = self.pre_pause_runtime_state;

        if self.imaging_armed {
            self.last_frame_count = self.state.frame_count;
            self.last_frame_at = self.logical_now();
        }

        self.operator.sync_pause(false);
        tracing::info!(
            paused_seconds = pause_span.as_secs_f64(),
            "session runtime resumed"
        );
        Ok(())
    }

    fn terminate_with(&mut self, abort_reason: Option<String>) -> CoordinatorResult<()> {
        if self.state.terminated {
            return Ok(());
        }
        self.state.terminated = true;

        match &abort_reason {
            Some(reason) => tracing::error!(reason = %reason, "session terminated abnormally"),
            None => tracing::info!("session terminated"),
        }

        // Hardware is always commanded to a safe state, even when individual
        // writes fail during shutdown.
        if let Err(err) = self.actuator.set_brake(true) {
            tracing::error!(error = %err, "failed to engage brake during termination");
        }
        if let Err(err) = self.actuator.set_screens(false) {
            tracing::error!(error = %err, "failed to blank screens during termination");
        }

        let snapshot = HardwareSnapshot {
            valve_pulses: self.signals.valve_pulses.count().unwrap_or(0),
            puff_count: self.signals.puffs.count().unwrap_or(0),
            lick_count: self.signals.licks.count().unwrap_or(0),
            frame_count: self.signals.imaging_frames.count().unwrap_or(0),
            distance_cm: self.signals.encoder.distance_cm().unwrap_or(0.0),
        };
        if let Ok(body) = serde_json::to_vec(&snapshot) {
            self.log(LogEventCode::HardwareSnapshot, &body);
        }

        let _ = self.transport.publish(VrTopic::SessionStop, &[]);

        if let Some(policy) = self.policy.as_ref() {
            let reward = policy.guidance(TrialKind::Reward).counters();
            let aversive = policy.guidance(TrialKind::Aversive).counters();
            self.descriptor.completed_trials = reward.completed + aversive.completed;
            self.descriptor.guided_reward_trials = reward.guided;
            self.descriptor.guided_aversive_trials = aversive.guided;
        }
        let outcome = match abort_reason {
            Some(reason) => SessionOutcome::Aborted { reason },
            None => SessionOutcome::Complete,
        };
        self.descriptor.finalize(&self.state, outcome);
        if let Err(err) = self.descriptor_store.persist(&self.descriptor) {
            tracing::error!(error = %err, "failed to persist session descriptor");
        }

        self.state.system_state = SystemState::Idle;
        self.state.runtime_state = RUNTIME_STATE_IDLE;
        self.log(LogEventCode::SystemState, &[SystemState::Idle.code()]);
        Ok(())
    }

    fn fail(&mut self, err: CoordinatorError) -> CoordinatorError {
        let reason = err.to_string();
        if let Err(shutdown_err) = self.terminate_with(Some(reason)) {
            tracing::error!(error = %shutdown_err, "termination path failed");
        }
        err
    }

    // =========================================================================
    // Cue sequence handshake
    // =========================================================================

    /// Requests the wall-cue sequence from the VR engine, with bounded retries
    /// before escalating to a fatal handshake error.
    fn fetch_cue_sequence(&mut self) -> CoordinatorResult<()> {
        let attempts = self.config.options.handshake_attempts;
        for attempt in 1..=attempts {
            self.transport.publish(VrTopic::CueSequenceRequest, &[])?;

            let budget = self.config.options.handshake_timeout_ms.max(1);
            for _ in 0..budget {
                while let Some(message) = self.transport.try_recv() {
                    if message.topic == VrTopic::CueSequence {
                        let payload: CueSequencePayload =
                            serde_json::from_slice(&message.payload)
                                .map_err(|e| CoordinatorError::Transport(e.to_string()))?;
                        self.install_cue_sequence(payload.cue_sequence)?;
                        return Ok(());
                    }
                    // Stale messages from before the handshake are discarded.
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            tracing::warn!(attempt, attempts, "cue-sequence handshake attempt timed out");
        }
        Err(CoordinatorError::HandshakeTimeout {
            request: "cue sequence",
            attempts,
        })
    }

    fn install_cue_sequence(&mut self, cues: Vec<u8>) -> CoordinatorResult<()> {
        self.log(LogEventCode::CueSequence, &cues);

        let min_motif = self
            .config
            .trials
            .iter()
            .map(|t| t.cues.len())
            .filter(|len| *len > 0)
            .min()
            .unwrap_or(1);
        let max_trials = cues.len() / min_motif + 1;

        let boundaries = self
            .decomposer
            .decompose(&self.config.trials, &cues, max_trials);
        match self.policy.as_mut() {
            Some(policy) => policy.reset_plan(&self.config.trials, &boundaries),
            None => {
                self.policy = Some(TrialPolicy::new(
                    &self.config.trials,
                    &boundaries,
                    self.config.reward_guidance,
                    self.config.aversive_guidance,
                ));
            }
        }

        let distance = self.signals.encoder.distance_cm()?;
        let position = self.signals.encoder.position()?;
        self.trial_start_distance = distance;
        self.state.distance_cm = distance;
        self.state.position = position;
        self.window_origin = self.logical_now();
        self.window_distance = distance;
        self.cue_sequence = cues;

        tracing::info!(
            cues = self.cue_sequence.len(),
            trials = self.policy.as_ref().map(TrialPolicy::trial_count).unwrap_or(0),
            "cue sequence received and decomposed"
        );
        self.sync_guidance()?;
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Publishes guidance-state changes to the VR engine and mirrors them to the
    /// operator surface. No-op for kinds whose state is unchanged.
    fn sync_guidance(&mut self) -> CoordinatorResult<()> {
        let states = match self.policy.as_ref() {
            Some(policy) => [
                (TrialKind::Reward, policy.guidance(TrialKind::Reward).enabled()),
                (
                    TrialKind::Aversive,
                    policy.guidance(TrialKind::Aversive).enabled(),
                ),
            ],
            None => return Ok(()),
        };

        for (kind, enabled) in states {
            let slot = kind_slot(kind);
            // Disabled is the engine-side default, so an unsent disabled state
            // needs no message.
            let previous = self.guidance_sent[slot].unwrap_or(false);
            if previous != enabled {
                self.guidance_sent[slot] = Some(enabled);
                let payload = serde_json::to_vec(&TogglePayload { enabled })?;
                self.transport.publish(VrTopic::guidance_for(kind), &payload)?;
                self.log(
                    LogEventCode::GuidanceState,
                    &[kind_code(kind), u8::from(enabled)],
                );
                self.operator.sync_guidance(kind, enabled);
                tracing::info!(?kind, enabled, "guidance state changed");
            }
        }
        Ok(())
    }

    /// Delivers a reward unconditionally, tracking the dispensed volume against
    /// the paused or active accumulator.
    fn deliver_reward(&mut self, volume_ul: f64) -> CoordinatorResult<()> {
        self.actuator.open_valve(volume_ul)?;
        if self.state.paused {
            self.state.paused_volume_ul += volume_ul;
        } else {
            self.state.delivered_volume_ul += volume_ul;
        }
        self.state.unconsumed_rewards += 1;
        self.visualizer.valve_event();
        Ok(())
    }

    /// Delivers or simulates an earned reward, honoring the unconsumed-reward
    /// gate. Returns whether water was actually dispensed.
    fn resolve_reward(&mut self, volume_ul: f64, tone: Duration) -> CoordinatorResult<bool> {
        if self.state.paused {
            return Ok(false);
        }
        if self.state.unconsumed_rewards < self.config.options.max_unconsumed_rewards {
            self.deliver_reward(volume_ul)?;
            Ok(true)
        } else {
            // The animal is not drinking; acknowledge the success with the tone
            // only.
            self.actuator.pulse_tone(tone)?;
            Ok(false)
        }
    }

    fn log(&mut self, code: LogEventCode, body: &[u8]) {
        self.logger.append(LogRecord::new(
            COORDINATOR_SOURCE_ID,
            self.clock.elapsed(),
            code,
            body,
        ));
    }

    /// Logical session time: wall time minus the accumulated paused time, frozen
    /// while a pause is in progress.
    fn logical_now(&self) -> Duration {
        let wall = if self.state.paused {
            self.pause_started_at
        } else {
            self.clock.elapsed()
        };
        wall.saturating_sub(self.state.paused_time)
    }

    fn effective_speed_threshold(&self) -> f64 {
        (self.config.options.speed_threshold_cm_s + f64::from(self.modifiers.0) * 0.5).max(0.0)
    }

    fn effective_duration_threshold(&self) -> Duration {
        let base = self.config.options.duration_threshold_ms as i64;
        let adjusted = base + i64::from(self.modifiers.1) * 50;
        Duration::from_millis(adjusted.max(0) as u64)
    }

    // =========================================================================
    // Runtime properties
    // =========================================================================

    /// Whether the session has terminated.
    pub fn terminated(&self) -> bool {
        self.state.terminated
    }

    /// Whether the runtime is currently paused.
    pub fn paused(&self) -> bool {
        self.state.paused
    }

    /// Current windowed running-speed estimate, in cm/s.
    pub fn running_speed(&self) -> f64 {
        self.state.running_speed_cm_s
    }

    /// Current operator speed-threshold modifier.
    pub fn speed_modifier(&self) -> i32 {
        self.modifiers.0
    }

    /// Current operator duration-threshold modifier.
    pub fn duration_modifier(&self) -> i32 {
        self.modifiers.1
    }

    /// Water volume dispensed during active runtime, in microliters.
    pub fn dispensed_volume(&self) -> f64 {
        self.state.delivered_volume_ul
    }

    /// Read-only view of the session state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The session descriptor in its current (possibly unfinalized) form.
    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    /// The cue sequence received from the VR engine, empty before the handshake.
    pub fn cue_sequence(&self) -> &[u8] {
        &self.cue_sequence
    }

    /// The trial policy, once a cue sequence has been decomposed.
    pub fn policy(&self) -> Option<&TrialPolicy> {
        self.policy.as_ref()
    }

    /// The runtime options the session was configured with.
    pub fn options(&self) -> &RuntimeOptions {
        &self.config.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{GuidanceSettings, TrialStructure};
    use crate::datalog::MemoryLogger;
    use crate::hardware::{ActuatorCommand, MockActuator, MockEncoder, MockSignals};
    use crate::operator::MockOperator;
    use crate::session::MemoryDescriptorStore;
    use crate::transport::MockTransport;
    use crate::visualizer::RecordingVisualizer;

    struct Fixture {
        coordinator: Coordinator,
        clock: ManualClock,
        encoder: MockEncoder,
        actuator: MockActuator,
        transport: MockTransport,
        operator: MockOperator,
        store: MemoryDescriptorStore,
        logger: MemoryLogger,
    }

    fn fixture(config: ExperimentConfiguration) -> Fixture {
        let clock = ManualClock::new();
        let signals = MockSignals::new();
        let actuator = MockActuator::new();
        let transport = MockTransport::new();
        let operator = MockOperator::new();
        let store = MemoryDescriptorStore::new();
        let logger = MemoryLogger::new();
        let encoder = signals.encoder.clone();

        let collaborators = Collaborators {
            clock: Box::new(clock.clone()),
            signals: signals.channels,
            actuator: Box::new(actuator.clone()),
            transport: Box::new(transport.clone()),
            logger: Box::new(logger.clone()),
            visualizer: Box::new(RecordingVisualizer::new()),
            operator: Box::new(operator.clone()),
            descriptor_store: Box::new(store.clone()),
        };
        let coordinator =
            Coordinator::new("mouse-test", config, collaborators).expect("valid config");

        Fixture {
            coordinator,
            clock,
            encoder,
            actuator,
            transport,
            operator,
            store,
            logger,
        }
    }

    fn experiment_config() -> ExperimentConfiguration {
        let mut config = ExperimentConfiguration {
            trials: vec![
                TrialStructure::reward("near", vec![1, 2, 3], 50.0, 5.0),
                TrialStructure::aversive("dark", vec![4, 5], 20.0, 100),
            ],
            ..ExperimentConfiguration::default()
        };
        config.reward_guidance = GuidanceSettings {
            initial_guided_trials: 0,
            recovery_threshold: 9,
            recovery_guided_trials: 3,
        };
        config.aversive_guidance = config.reward_guidance;
        config.options.handshake_timeout_ms = 5;
        config
    }

    #[test]
    fn test_start_handshake_builds_policy() {
        let mut fx = fixture(experiment_config());
        fx.transport.respond_with_cues(vec![1, 2, 3, 4, 5, 1, 2, 3]);

        fx.coordinator.start().expect("handshake succeeds");

        let policy = fx.coordinator.policy().expect("policy built");
        assert_eq!(policy.trial_count(), 3);
        assert_eq!(fx.coordinator.cue_sequence(), &[1, 2, 3, 4, 5, 1, 2, 3]);
    }

    #[test]
    fn test_handshake_timeout_terminates_session() {
        let mut config = experiment_config();
        config.options.handshake_attempts = 2;
        config.options.handshake_timeout_ms = 2;
        let mut fx = fixture(config);
        // No scripted cue response: the engine never answers.

        let err = fx.coordinator.start().expect_err("handshake must fail");
        assert!(matches!(err, CoordinatorError::HandshakeTimeout { attempts: 2, .. }));
        assert!(fx.coordinator.terminated());

        let persisted = fx.store.persisted();
        assert_eq!(persisted.len(), 1);
        assert!(matches!(persisted[0].outcome, SessionOutcome::Aborted { .. }));
    }

    #[test]
    fn test_transitions_blocked_after_termination() {
        let mut fx = fixture(ExperimentConfiguration::default());
        fx.coordinator.stop().expect("stop");

        assert!(fx.coordinator.idle().is_ok(), "idle stays reachable");
        let err = fx.coordinator.run().expect_err("run must be rejected");
        assert!(matches!(err, CoordinatorError::InvalidTransition { .. }));
    }

    #[test]
    fn test_mode_entry_points_command_hardware() {
        let mut fx = fixture(ExperimentConfiguration::default());

        fx.coordinator.run().expect("run");
        assert!(fx
            .actuator
            .commands()
            .contains(&ActuatorCommand::Screens(true)));
        assert!(fx
            .actuator
            .commands()
            .contains(&ActuatorCommand::Brake(false)));

        fx.coordinator.rest().expect("rest");
        let commands = fx.actuator.commands();
        assert_eq!(commands.last(), Some(&ActuatorCommand::Brake(true)));
    }

    #[test]
    fn test_termination_is_idempotent() {
        let mut fx = fixture(ExperimentConfiguration::default());
        fx.coordinator.start().expect("start");

        fx.coordinator.terminate_runtime().expect("first terminate");
        let commands_after_first = fx.actuator.commands().len();
        let records_after_first = fx.logger.records().len();

        fx.coordinator.terminate_runtime().expect("second terminate");
        assert_eq!(fx.actuator.commands().len(), commands_after_first);
        assert_eq!(fx.logger.records().len(), records_after_first);
        assert_eq!(fx.store.persisted().len(), 1);

        // No further cycle executes after termination.
        fx.coordinator.runtime_cycle().expect("cycle is a no-op");
        assert_eq!(fx.logger.records().len(), records_after_first);
    }

    #[test]
    fn test_pause_freezes_logical_time_and_distance() {
        let mut fx = fixture(ExperimentConfiguration::default());
        fx.coordinator.start().expect("start");
        fx.coordinator.run_train().expect("run_train");

        fx.clock.advance_ms(100);
        fx.encoder.advance(10.0);
        fx.coordinator.runtime_cycle().expect("cycle");
        assert_eq!(fx.coordinator.state().distance_cm, 10.0);

        fx.operator.set_pause(true);
        fx.coordinator.runtime_cycle().expect("pause cycle");
        assert!(fx.coordinator.paused());
        assert_eq!(fx.coordinator.state().system_state, SystemState::Idle);

        // Hardware keeps moving while paused; logical accounting must not.
        let speed_before = fx.coordinator.running_speed();
        fx.clock.advance_ms(500);
        fx.encoder.advance(25.0);
        fx.coordinator.runtime_cycle().expect("paused cycle");
        assert_eq!(fx.coordinator.state().distance_cm, 10.0);
        assert_eq!(fx.coordinator.running_speed(), speed_before);

        fx.operator.set_pause(false);
        fx.coordinator.runtime_cycle().expect("resume cycle");
        assert!(!fx.coordinator.paused());
        assert_eq!(fx.coordinator.state().system_state, SystemState::RunTraining);
        assert_eq!(fx.coordinator.state().paused_time, Duration::from_millis(500));
        // The paused movement was discarded from logical distance tracking.
        assert_eq!(fx.coordinator.state().distance_cm, 35.0);
    }

    #[test]
    fn test_manual_reward_during_pause_accrues_to_paused_volume() {
        let mut fx = fixture(ExperimentConfiguration::default());
        fx.coordinator.start().expect("start");
        fx.coordinator.rest().expect("rest");

        fx.operator.set_pause(true);
        fx.coordinator.runtime_cycle().expect("pause cycle");

        fx.operator.request_manual_reward(7.0);
        fx.coordinator.runtime_cycle().expect("reward cycle");

        assert_eq!(fx.coordinator.state().paused_volume_ul, 7.0);
        assert_eq!(fx.coordinator.dispensed_volume(), 0.0);
        assert_eq!(fx.actuator.valve_count(), 1);
        assert_eq!(
            fx.coordinator.state().unconsumed_rewards,
            0,
            "manual rewards during a pause do not count as unconsumed"
        );
    }

    #[test]
    fn test_hardware_read_failure_is_fatal() {
        let clock = ManualClock::new();
        let signals = MockSignals::new();
        signals.licks.fail_reads();
        let store = MemoryDescriptorStore::new();
        let collaborators = Collaborators {
            clock: Box::new(clock),
            signals: signals.channels,
            actuator: Box::new(MockActuator::new()),
            transport: Box::new(MockTransport::new()),
            logger: Box::new(MemoryLogger::new()),
            visualizer: Box::new(RecordingVisualizer::new()),
            operator: Box::new(MockOperator::new()),
            descriptor_store: Box::new(store.clone()),
        };
        let mut coordinator =
            Coordinator::new("mouse-test", ExperimentConfiguration::default(), collaborators)
                .expect("valid config");
        coordinator.start().expect("start");

        let err = coordinator.runtime_cycle().expect_err("read failure is fatal");
        assert!(matches!(err, CoordinatorError::Hardware { .. }));
        assert!(coordinator.terminated());

        let persisted = store.persisted();
        assert_eq!(persisted.len(), 1);
        assert!(matches!(persisted[0].outcome, SessionOutcome::Aborted { .. }));
    }

    #[test]
    fn test_modifier_changes_update_thresholds() {
        let mut fx = fixture(ExperimentConfiguration::default());
        fx.coordinator.start().expect("start");
        fx.coordinator.run_train().expect("run_train");

        fx.operator.set_modifiers(2, -1);
        fx.coordinator.runtime_cycle().expect("cycle");

        assert_eq!(fx.coordinator.speed_modifier(), 2);
        assert_eq!(fx.coordinator.duration_modifier(), -1);
    }

    #[test]
    fn test_vr_termination_pauses_and_snapshots_distance() {
        let mut fx = fixture(experiment_config());
        fx.transport.respond_with_cues(vec![1, 2, 3, 4, 5]);
        fx.coordinator.start().expect("start");
        fx.coordinator.run().expect("run");

        fx.transport.push_termination();
        fx.coordinator.runtime_cycle().expect("cycle");

        assert!(fx.coordinator.paused());
        assert_eq!(fx.coordinator.state().system_state, SystemState::Idle);
        assert_eq!(fx.logger.count_with_code(LogEventCode::DistanceSnapshot), 1);

        // Resuming re-queries the cue sequence from the restarted engine.
        let requests_before = fx
            .transport
            .published_count(VrTopic::CueSequenceRequest);
        fx.operator.set_pause(false);
        fx.coordinator.runtime_cycle().expect("resume cycle");
        assert!(!fx.coordinator.paused());
        assert_eq!(
            fx.transport.published_count(VrTopic::CueSequenceRequest),
            requests_before + 1
        );
    }
}
