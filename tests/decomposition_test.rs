//! Tests for cue-sequence decomposition, from the decomposer itself up through
//! the coordinator's startup handshake.

mod common;

use common::Harness;
use mesovr::config::{ExperimentConfiguration, GuidanceSettings, TrialStructure};
use mesovr::error::CoordinatorError;
use mesovr::motif::MotifDecomposer;
use mesovr::session::SessionOutcome;
use mesovr::transport::VrTopic;

fn two_motif_trials() -> Vec<TrialStructure> {
    vec![
        TrialStructure::reward("near", vec![1, 2, 3], 50.0, 5.0),
        TrialStructure::aversive("dark", vec![4, 5], 20.0, 100),
    ]
}

fn experiment_config() -> ExperimentConfiguration {
    let mut config = ExperimentConfiguration {
        trials: two_motif_trials(),
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
fn decomposition_is_deterministic_across_cache_states() {
    let trials = two_motif_trials();
    let sequence: Vec<u8> = std::iter::repeat([1u8, 2, 3, 9, 4, 5])
        .take(40)
        .flatten()
        .collect();

    let mut decomposer = MotifDecomposer::new();
    let cold = decomposer.decompose(&trials, &sequence, 4096);
    let warm = decomposer.decompose(&trials, &sequence, 4096);

    assert_eq!(cold, warm);
    assert_eq!(decomposer.rebuild_count(), 1);

    // A fresh decomposer (cold cache) produces the identical boundary list.
    let mut fresh = MotifDecomposer::new();
    assert_eq!(fresh.decompose(&trials, &sequence, 4096), cold);
}

#[test]
fn first_registered_motif_wins_overlapping_matches() {
    let trials = vec![
        TrialStructure::reward("short", vec![1, 2], 10.0, 5.0),
        TrialStructure::reward("long", vec![1, 2, 3, 4], 40.0, 5.0),
    ];
    let mut decomposer = MotifDecomposer::new();
    let boundaries = decomposer.decompose(&trials, &[1, 2, 3, 4], 16);

    // The shorter motif is registered first and matches at position 0, so the
    // longer one never gets a chance; cues 3 and 4 are skipped as unmatched.
    assert_eq!(boundaries.len(), 1);
    assert_eq!(boundaries[0].motif, 0);
}

#[test]
fn startup_handshake_decomposes_reference_sequence() {
    let mut harness = Harness::new(experiment_config());
    harness.transport.respond_with_cues(vec![1, 2, 3, 4, 5, 1, 2, 3]);

    harness.coordinator.start().expect("handshake succeeds");

    let policy = harness.coordinator.policy().expect("policy built");
    assert_eq!(policy.trial_count(), 3);

    let distances: Vec<f64> = policy.planned().iter().map(|t| t.distance_cm).collect();
    assert_eq!(distances, vec![50.0, 20.0, 50.0]);
    assert_eq!(harness.coordinator.cue_sequence(), &[1, 2, 3, 4, 5, 1, 2, 3]);
}

#[test]
fn handshake_ignores_stale_messages() {
    let mut harness = Harness::new(experiment_config());
    // Stale junk queued before the request must be discarded.
    harness.transport.push_inbound(VrTopic::Lick, Vec::new());
    harness
        .transport
        .push_inbound(VrTopic::RewardZoneEntry, Vec::new());
    harness.transport.respond_with_cues(vec![1, 2, 3]);

    harness.coordinator.start().expect("handshake succeeds");
    assert_eq!(harness.coordinator.cue_sequence(), &[1, 2, 3]);
}

#[test]
fn handshake_timeout_aborts_the_session() {
    let mut config = experiment_config();
    config.options.handshake_attempts = 2;
    config.options.handshake_timeout_ms = 2;
    let mut harness = Harness::new(config);
    // The engine never answers.

    let err = harness.coordinator.start().expect_err("handshake must time out");
    assert!(matches!(
        err,
        CoordinatorError::HandshakeTimeout { attempts: 2, .. }
    ));
    assert!(harness.coordinator.terminated());

    let persisted = harness.store.persisted();
    assert_eq!(persisted.len(), 1);
    assert!(matches!(persisted[0].outcome, SessionOutcome::Aborted { .. }));

    // Both attempts actually went out on the wire.
    assert_eq!(
        harness.transport.published_count(VrTopic::CueSequenceRequest),
        2
    );
}

#[test]
fn training_sessions_skip_the_handshake() {
    let mut harness = Harness::new(ExperimentConfiguration::default());
    harness.coordinator.start().expect("start without trials");

    assert!(harness.coordinator.policy().is_none());
    assert_eq!(
        harness.transport.published_count(VrTopic::CueSequenceRequest),
        0
    );
}
