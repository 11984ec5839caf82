//! Experiment configuration for mesoscope-VR sessions.
//!
//! The configuration describes the trial structures available to a session (the wall-cue
//! motif, physical length, and outcome parameters of each trial type), the adaptive
//! guidance settings for both trial kinds, and the runtime timing constants of the
//! control loop. Configurations are loaded from TOML files through the `config` crate
//! and validated semantically before a session is allowed to start: a malformed trial
//! structure is a fatal setup error, never a runtime one.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};

/// The behavioral kind of a trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialKind {
    /// Reward-seeking trial. Success delivers a water reward.
    Reward,
    /// Aversive trial. Failure triggers a gas puff.
    Aversive,
}

fn default_reward_probability() -> f64 {
    1.0
}

/// Configured structure of one trial type.
///
/// The cue motif identifies occurrences of this trial type inside the session's raw
/// cue sequence; the remaining fields parameterize the outcome the coordinator
/// resolves when the animal finishes a trial of this type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrialStructure {
    /// Human-readable trial type name used in logs and descriptors.
    pub name: String,
    /// Ordered wall-cue identifiers that make up this trial's motif.
    pub cues: Vec<u8>,
    /// Physical length of one traversal of this trial, in centimeters.
    pub distance_cm: f64,
    /// Whether the trial is reward-seeking or aversive.
    pub kind: TrialKind,
    /// Water volume delivered on success, in microliters. Ignored for aversive trials.
    #[serde(default)]
    pub reward_volume_ul: f64,
    /// Duration of the auditory tone accompanying reward delivery, in milliseconds.
    #[serde(default)]
    pub reward_tone_ms: u64,
    /// Probability that an earned (unguided) reward is actually released.
    #[serde(default = "default_reward_probability")]
    pub reward_probability: f64,
    /// Gas puff duration applied on failure, in milliseconds. Ignored for reward trials.
    #[serde(default)]
    pub puff_duration_ms: u64,
}

impl TrialStructure {
    /// Creates a reward-seeking trial structure.
    pub fn reward(name: &str, cues: Vec<u8>, distance_cm: f64, volume_ul: f64) -> Self {
        Self {
            name: name.to_string(),
            cues,
            distance_cm,
            kind: TrialKind::Reward,
            reward_volume_ul: volume_ul,
            reward_tone_ms: 300,
            reward_probability: 1.0,
            puff_duration_ms: 0,
        }
    }

    /// Creates an aversive trial structure.
    pub fn aversive(name: &str, cues: Vec<u8>, distance_cm: f64, puff_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            cues,
            distance_cm,
            kind: TrialKind::Aversive,
            reward_volume_ul: 0.0,
            reward_tone_ms: 0,
            reward_probability: 1.0,
            puff_duration_ms: puff_ms,
        }
    }
}

/// Adaptive guidance settings for one trial kind.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceSettings {
    /// Number of trials executed in guidance mode at session start.
    pub initial_guided_trials: u32,
    /// Consecutive unguided failures that trigger the recovery mode.
    pub recovery_threshold: u32,
    /// Number of guided trials executed once recovery engages.
    pub recovery_guided_trials: u32,
}

impl Default for GuidanceSettings {
    fn default() -> Self {
        Self {
            initial_guided_trials: 3,
            recovery_threshold: 9,
            recovery_guided_trials: 3,
        }
    }
}

/// Timing constants and runtime policy knobs of the control loop.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Scheduler tick interval of the outer session loop, in milliseconds.
    pub cycle_interval_ms: u64,
    /// Trailing window used to estimate running speed, in milliseconds.
    pub speed_window_ms: u64,
    /// Whether the session requires live imaging; enables the staleness watch.
    pub require_imaging: bool,
    /// Maximum tolerated gap between imaging frames before the session aborts,
    /// in milliseconds.
    pub mesoscope_frame_delay_ms: u64,
    /// Attempts made for the VR cue-sequence handshake before escalating.
    pub handshake_attempts: u32,
    /// Wait per handshake attempt, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Delivered-but-unlicked rewards tolerated before delivery switches to
    /// tone-only simulation.
    pub max_unconsumed_rewards: u32,
    /// Running-speed threshold for run-training success, in cm/s.
    pub speed_threshold_cm_s: f64,
    /// Sustained-speed duration required for run-training success, in milliseconds.
    pub duration_threshold_ms: u64,
    /// Water volume delivered per training reward, in microliters.
    pub training_reward_volume_ul: f64,
    /// Refractory interval between lick-training rewards, in milliseconds.
    pub lick_cooldown_ms: u64,
    /// Minimum interval between scalar visualizer updates, in milliseconds.
    pub visualizer_interval_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 10,
            speed_window_ms: 50,
            require_imaging: false,
            mesoscope_frame_delay_ms: 300,
            handshake_attempts: 3,
            handshake_timeout_ms: 2_000,
            max_unconsumed_rewards: 3,
            speed_threshold_cm_s: 5.0,
            duration_threshold_ms: 500,
            training_reward_volume_ul: 5.0,
            lick_cooldown_ms: 1_000,
            visualizer_interval_ms: 30,
        }
    }
}

impl RuntimeOptions {
    /// Trailing speed window as a [`Duration`].
    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms)
    }

    /// Maximum inter-frame gap as a [`Duration`].
    pub fn mesoscope_frame_delay(&self) -> Duration {
        Duration::from_millis(self.mesoscope_frame_delay_ms)
    }
}

/// Complete configuration of one experiment session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    /// Trial structures available to the session, in registration order.
    ///
    /// Registration order is load-bearing: the motif decomposer tries motifs in this
    /// order and the first match wins. An empty list describes a training session
    /// without a VR trial sequence.
    #[serde(default)]
    pub trials: Vec<TrialStructure>,
    /// Guidance settings applied to reward-seeking trials.
    #[serde(default)]
    pub reward_guidance: GuidanceSettings,
    /// Guidance settings applied to aversive trials.
    #[serde(default)]
    pub aversive_guidance: GuidanceSettings,
    /// Control-loop timing constants.
    #[serde(default)]
    pub options: RuntimeOptions,
}

impl ExperimentConfiguration {
    /// Loads and validates a configuration from a TOML file.
    pub fn from_file(path: &Path) -> CoordinatorResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .build()?;
        let configuration: ExperimentConfiguration = settings.try_deserialize()?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// Checks the semantic invariants that file parsing cannot express.
    ///
    /// Returns the first violation found. Sessions must not start with a
    /// configuration that fails validation.
    pub fn validate(&self) -> CoordinatorResult<()> {
        for trial in &self.trials {
            if trial.cues.is_empty() {
                return Err(CoordinatorError::Configuration(format!(
                    "trial '{}' has an empty cue motif; empty motifs would match at every \
                     sequence position",
                    trial.name
                )));
            }
            if trial.distance_cm < 0.0 || !trial.distance_cm.is_finite() {
                return Err(CoordinatorError::Configuration(format!(
                    "trial '{}' has an invalid distance of {} cm",
                    trial.name, trial.distance_cm
                )));
            }
            if !(0.0..=1.0).contains(&trial.reward_probability) {
                return Err(CoordinatorError::Configuration(format!(
                    "trial '{}' has a reward probability of {} outside [0, 1]",
                    trial.name, trial.reward_probability
                )));
            }
            if trial.kind == TrialKind::Reward && trial.reward_volume_ul <= 0.0 {
                return Err(CoordinatorError::Configuration(format!(
                    "reward trial '{}' must configure a positive reward volume",
                    trial.name
                )));
            }
            if trial.kind == TrialKind::Aversive && trial.puff_duration_ms == 0 {
                return Err(CoordinatorError::Configuration(format!(
                    "aversive trial '{}' must configure a positive puff duration",
                    trial.name
                )));
            }
        }

        if self.options.cycle_interval_ms == 0 {
            return Err(CoordinatorError::Configuration(
                "cycle interval must be positive".to_string(),
            ));
        }
        if self.options.speed_window_ms == 0 {
            return Err(CoordinatorError::Configuration(
                "speed window must be positive".to_string(),
            ));
        }
        if self.options.mesoscope_frame_delay_ms == 0 {
            return Err(CoordinatorError::Configuration(
                "mesoscope frame delay must be positive".to_string(),
            ));
        }
        if self.options.handshake_attempts == 0 {
            return Err(CoordinatorError::Configuration(
                "at least one handshake attempt is required".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn two_trial_config() -> ExperimentConfiguration {
        ExperimentConfiguration {
            trials: vec![
                TrialStructure::reward("near", vec![1, 2, 3], 50.0, 5.0),
                TrialStructure::aversive("dark", vec![4, 5], 20.0, 100),
            ],
            ..ExperimentConfiguration::default()
        }
    }

    #[test]
    fn test_valid_configuration_passes() {
        assert!(two_trial_config().validate().is_ok());
    }

    #[test]
    fn test_empty_trial_list_is_valid() {
        // Training sessions run without a trial sequence.
        assert!(ExperimentConfiguration::default().validate().is_ok());
    }

    #[test]
    fn test_empty_motif_rejected() {
        let mut cfg = two_trial_config();
        cfg.trials[0].cues.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("empty cue motif"));
    }

    #[test]
    fn test_negative_distance_rejected() {
        let mut cfg = two_trial_config();
        cfg.trials[1].distance_cm = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_distance_allowed() {
        // A zero-distance trial completes the instant it becomes active; it is a
        // legal, if unusual, configuration.
        let mut cfg = two_trial_config();
        cfg.trials[0].distance_cm = 0.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_probability_out_of_range_rejected() {
        let mut cfg = two_trial_config();
        cfg.trials[0].reward_probability = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rewardless_reward_trial_rejected() {
        let mut cfg = two_trial_config();
        cfg.trials[0].reward_volume_ul = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_file_round_trip() {
        let cfg = two_trial_config();
        let serialized = toml::to_string(&cfg).unwrap();

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(serialized.as_bytes()).unwrap();

        let loaded = ExperimentConfiguration::from_file(file.path()).unwrap();
        assert_eq!(loaded.trials.len(), 2);
        assert_eq!(loaded.trials[0].cues, vec![1, 2, 3]);
        assert_eq!(loaded.trials[1].kind, TrialKind::Aversive);
        assert_eq!(loaded.options.speed_window_ms, cfg.options.speed_window_ms);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut cfg = two_trial_config();
        cfg.trials[0].reward_probability = 2.0;
        let serialized = toml::to_string(&cfg).unwrap();

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(serialized.as_bytes()).unwrap();

        assert!(ExperimentConfiguration::from_file(file.path()).is_err());
    }
}
