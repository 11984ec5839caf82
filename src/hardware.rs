//! Hardware capability traits and mock implementations.
//!
//! The coordinator never talks to microcontrollers directly. It reads a set of named,
//! independently-updated signal channels (licks, valve pulses, puffs, encoder
//! distance, imaging frames) and issues fire-and-forget actuator commands (valve,
//! tone, puff, brake, screens) through the traits defined here. Every read is a
//! non-blocking point-in-time snapshot; no cross-channel atomicity is assumed, as
//! each channel is independently monotonic.
//!
//! Hardware faults are fatal: a read or write error is never retried inside the
//! control loop and forces immediate session termination.
//!
//! The mock implementations simulate the hardware processes for tests. Their shared
//! handles let a test advance counters while the coordinator under test reads them,
//! mirroring the producer/consumer split of the real system.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CoordinatorError, CoordinatorResult};

// =============================================================================
// Capability Traits
// =============================================================================

/// Monotonic event counter updated by an external hardware process.
pub trait CounterChannel: Send {
    /// Snapshot of the cumulative event count.
    fn count(&self) -> CoordinatorResult<u64>;
}

/// Wheel encoder channel exposing cumulative distance and track position.
pub trait EncoderChannel: Send {
    /// Total distance traveled since session onset, in centimeters.
    fn distance_cm(&self) -> CoordinatorResult<f64>;

    /// Absolute position along the VR track, in track units.
    ///
    /// Unlike the cumulative distance, the position may wrap when the animal
    /// completes a lap.
    fn position(&self) -> CoordinatorResult<f64>;
}

/// The full set of read channels consumed by the coordinator each cycle.
pub struct SignalChannels {
    /// Lick sensor event counter.
    pub licks: Box<dyn CounterChannel>,
    /// Water valve open-pulse counter.
    pub valve_pulses: Box<dyn CounterChannel>,
    /// Gas puff counter.
    pub puffs: Box<dyn CounterChannel>,
    /// Imaging (mesoscope) frame-acquisition counter.
    pub imaging_frames: Box<dyn CounterChannel>,
    /// Wheel encoder.
    pub encoder: Box<dyn EncoderChannel>,
}

/// Fire-and-forget actuator command interface.
///
/// Commands require no synchronous acknowledgement; an `Err` means the write
/// itself failed and the session must terminate.
pub trait ActuatorInterface: Send {
    /// Opens the water valve long enough to dispense `volume_ul` microliters.
    fn open_valve(&mut self, volume_ul: f64) -> CoordinatorResult<()>;

    /// Sounds the reward tone without dispensing water.
    fn pulse_tone(&mut self, duration: Duration) -> CoordinatorResult<()>;

    /// Triggers the gas puff for the given duration.
    fn trigger_puff(&mut self, duration: Duration) -> CoordinatorResult<()>;

    /// Engages or releases the wheel brake.
    fn set_brake(&mut self, engaged: bool) -> CoordinatorResult<()>;

    /// Turns the VR display screens on or off.
    fn set_screens(&mut self, on: bool) -> CoordinatorResult<()>;
}

// =============================================================================
// Mock Hardware
// =============================================================================

/// Shared mock counter.
///
/// The producing side of a test holds one handle and increments it; the
/// coordinator reads through the [`CounterChannel`] implementation.
#[derive(Clone, Default)]
pub struct MockCounter {
    count: Arc<Mutex<u64>>,
    fail: Arc<Mutex<bool>>,
}

impl MockCounter {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter by `n` events.
    pub fn add(&self, n: u64) {
        *self.count.lock() += n;
    }

    /// Makes all subsequent reads fail, simulating a dead channel.
    pub fn fail_reads(&self) {
        *self.fail.lock() = true;
    }
}

impl CounterChannel for MockCounter {
    fn count(&self) -> CoordinatorResult<u64> {
        if *self.fail.lock() {
            return Err(CoordinatorError::hardware("counter", "channel read failed"));
        }
        Ok(*self.count.lock())
    }
}

/// Shared mock encoder tracking distance and wrapped position.
#[derive(Clone, Default)]
pub struct MockEncoder {
    state: Arc<Mutex<(f64, f64)>>,
}

impl MockEncoder {
    /// Creates an encoder at the track origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the animal by `delta_cm` along the track.
    pub fn advance(&self, delta_cm: f64) {
        let mut state = self.state.lock();
        state.0 += delta_cm;
        state.1 += delta_cm;
    }

    /// Wraps the position back to the track origin, keeping cumulative distance.
    pub fn wrap_position(&self) {
        self.state.lock().1 = 0.0;
    }
}

impl EncoderChannel for MockEncoder {
    fn distance_cm(&self) -> CoordinatorResult<f64> {
        Ok(self.state.lock().0)
    }

    fn position(&self) -> CoordinatorResult<f64> {
        Ok(self.state.lock().1)
    }
}

/// Actuator command recorded by [`MockActuator`].
#[derive(Clone, Debug, PartialEq)]
pub enum ActuatorCommand {
    /// Valve opened for the given volume, in microliters.
    Valve(f64),
    /// Reward tone sounded for the given duration.
    Tone(Duration),
    /// Puff triggered for the given duration.
    Puff(Duration),
    /// Brake engaged (`true`) or released (`false`).
    Brake(bool),
    /// Screens switched on (`true`) or off (`false`).
    Screens(bool),
}

/// Recording mock actuator.
///
/// Stores every issued command in order so tests can assert on the exact
/// hardware traffic a scenario produced.
#[derive(Clone, Default)]
pub struct MockActuator {
    commands: Arc<Mutex<Vec<ActuatorCommand>>>,
    fail: Arc<Mutex<bool>>,
}

impl MockActuator {
    /// Creates an actuator with an empty command log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all commands issued so far.
    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.commands.lock().clone()
    }

    /// Number of valve-open commands issued.
    pub fn valve_count(&self) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| matches!(c, ActuatorCommand::Valve(_)))
            .count()
    }

    /// Number of puff commands issued.
    pub fn puff_count(&self) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| matches!(c, ActuatorCommand::Puff(_)))
            .count()
    }

    /// Makes all subsequent commands fail, simulating a dead write channel.
    pub fn fail_writes(&self) {
        *self.fail.lock() = true;
    }

    fn record(&self, command: ActuatorCommand) -> CoordinatorResult<()> {
        if *self.fail.lock() {
            return Err(CoordinatorError::hardware("actuator", "command write failed"));
        }
        self.commands.lock().push(command);
        Ok(())
    }
}

impl ActuatorInterface for MockActuator {
    fn open_valve(&mut self, volume_ul: f64) -> CoordinatorResult<()> {
        self.record(ActuatorCommand::Valve(volume_ul))
    }

    fn pulse_tone(&mut self, duration: Duration) -> CoordinatorResult<()> {
        self.record(ActuatorCommand::Tone(duration))
    }

    fn trigger_puff(&mut self, duration: Duration) -> CoordinatorResult<()> {
        self.record(ActuatorCommand::Puff(duration))
    }

    fn set_brake(&mut self, engaged: bool) -> CoordinatorResult<()> {
        self.record(ActuatorCommand::Brake(engaged))
    }

    fn set_screens(&mut self, on: bool) -> CoordinatorResult<()> {
        self.record(ActuatorCommand::Screens(on))
    }
}

/// Bundle of mock channels plus the producer-side handles.
///
/// `channels` is handed to the coordinator; the remaining fields stay with the
/// test to drive the simulated hardware.
pub struct MockSignals {
    /// Channel bundle for the coordinator under test.
    pub channels: SignalChannels,
    /// Producer handle for the lick counter.
    pub licks: MockCounter,
    /// Producer handle for the valve pulse counter.
    pub valve_pulses: MockCounter,
    /// Producer handle for the puff counter.
    pub puffs: MockCounter,
    /// Producer handle for the imaging frame counter.
    pub imaging_frames: MockCounter,
    /// Producer handle for the encoder.
    pub encoder: MockEncoder,
}

impl MockSignals {
    /// Creates a full set of mock channels, all at zero.
    pub fn new() -> Self {
        let licks = MockCounter::new();
        let valve_pulses = MockCounter::new();
        let puffs = MockCounter::new();
        let imaging_frames = MockCounter::new();
        let encoder = MockEncoder::new();

        let channels = SignalChannels {
            licks: Box::new(licks.clone()),
            valve_pulses: Box::new(valve_pulses.clone()),
            puffs: Box::new(puffs.clone()),
            imaging_frames: Box::new(imaging_frames.clone()),
            encoder: Box::new(encoder.clone()),
        };

        Self {
            channels,
            licks,
            valve_pulses,
            puffs,
            imaging_frames,
            encoder,
        }
    }
}

impl Default for MockSignals {
    fn default() -> Self {
        Self::new()
    }
}
