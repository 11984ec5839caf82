//! Shared harness for coordinator integration tests.
//!
//! Builds a [`Coordinator`] wired entirely to mocks and keeps the producer-side
//! handles so tests can script hardware, transport, and operator activity while
//! driving the control loop cycle by cycle.

// Each integration test binary compiles this module independently and uses a
// different subset of the handles.
#![allow(dead_code)]

use mesovr::clock::ManualClock;
use mesovr::config::ExperimentConfiguration;
use mesovr::coordinator::{Collaborators, Coordinator};
use mesovr::datalog::MemoryLogger;
use mesovr::hardware::{MockActuator, MockCounter, MockEncoder, MockSignals};
use mesovr::operator::MockOperator;
use mesovr::session::MemoryDescriptorStore;
use mesovr::transport::MockTransport;
use mesovr::visualizer::RecordingVisualizer;

pub struct Harness {
    pub coordinator: Coordinator,
    pub clock: ManualClock,
    pub licks: MockCounter,
    pub valve_pulses: MockCounter,
    pub puffs: MockCounter,
    pub imaging_frames: MockCounter,
    pub encoder: MockEncoder,
    pub actuator: MockActuator,
    pub transport: MockTransport,
    pub logger: MemoryLogger,
    pub visualizer: RecordingVisualizer,
    pub operator: MockOperator,
    pub store: MemoryDescriptorStore,
}

impl Harness {
    pub fn new(config: ExperimentConfiguration) -> Self {
        // Route runtime tracing through the test harness; repeat installs are
        // expected across tests and ignored.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();

        let clock = ManualClock::new();
        let signals = MockSignals::new();
        let actuator = MockActuator::new();
        let transport = MockTransport::new();
        let logger = MemoryLogger::new();
        let visualizer = RecordingVisualizer::new();
        let operator = MockOperator::new();
        let store = MemoryDescriptorStore::new();

        let collaborators = Collaborators {
            clock: Box::new(clock.clone()),
            signals: signals.channels,
            actuator: Box::new(actuator.clone()),
            transport: Box::new(transport.clone()),
            logger: Box::new(logger.clone()),
            visualizer: Box::new(visualizer.clone()),
            operator: Box::new(operator.clone()),
            descriptor_store: Box::new(store.clone()),
        };
        let coordinator =
            Coordinator::new("mouse-7", config, collaborators).expect("configuration is valid");

        Self {
            coordinator,
            clock,
            licks: signals.licks,
            valve_pulses: signals.valve_pulses,
            puffs: signals.puffs,
            imaging_frames: signals.imaging_frames,
            encoder: signals.encoder,
            actuator,
            transport,
            logger,
            visualizer,
            operator,
            store,
        }
    }

    /// Runs one cycle, panicking on unexpected fatal errors.
    pub fn cycle(&mut self) {
        self.coordinator
            .runtime_cycle()
            .expect("cycle completed without a fatal error");
    }

    /// Runs `n` cycles.
    pub fn cycles(&mut self, n: usize) {
        for _ in 0..n {
            self.cycle();
        }
    }
}
