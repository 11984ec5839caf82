//! Append-only data logging for session runtime records.
//!
//! Every record carries a source identifier, a monotonic timestamp, and a payload
//! whose first byte is a [`LogEventCode`] discriminant. Structured bodies are JSON
//! encoded behind the code byte. The sink is append-only with no read-back
//! requirement and is assumed non-blocking from the coordinator's perspective, so a
//! single-writer discipline is all the coordinator guarantees.
//!
//! Raw behavior samples keep flowing to the logger even while the session is
//! paused; pausing freezes policy decisions, not data capture.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Source identifier the coordinator stamps on all of its records.
///
/// The id has to be unique across every producer logging into the same session
/// stream (microcontroller interfaces, cameras, etc.).
pub const COORDINATOR_SOURCE_ID: u8 = 1;

/// Discriminants for the coordinator's record payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LogEventCode {
    /// The system changed its configuration state.
    SystemState = 1,
    /// The session changed its runtime (task stage) state.
    RuntimeState = 2,
    /// A guidance mode was toggled.
    GuidanceState = 3,
    /// The reward-zone boundary marker visibility changed.
    RewardZoneMarker = 4,
    /// Snapshot of total traveled distance, taken when the cue sequence resets.
    DistanceSnapshot = 5,
    /// A trial finished and its outcome was resolved.
    TrialOutcome = 6,
    /// Periodic behavior sample from the data cycle.
    Sample = 7,
    /// Final hardware-state snapshot flushed during termination.
    HardwareSnapshot = 8,
    /// The raw wall-cue sequence received from the VR engine.
    CueSequence = 9,
}

/// One record appended to the session data stream.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Producer identifier.
    pub source: u8,
    /// Monotonic timestamp relative to session onset.
    pub timestamp: Duration,
    /// Code byte followed by the (optionally JSON) body.
    pub payload: Vec<u8>,
}

impl LogRecord {
    /// Builds a record with the given code byte and raw body.
    pub fn new(source: u8, timestamp: Duration, code: LogEventCode, body: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(code as u8);
        payload.extend_from_slice(body);
        Self {
            source,
            timestamp,
            payload,
        }
    }

    /// The record's code byte, if the payload is non-empty.
    pub fn code(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// The payload body behind the code byte.
    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or(&[])
    }
}

/// Periodic behavior sample appended by the data cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BehaviorSample {
    /// Cumulative traveled distance, in centimeters.
    pub distance_cm: f64,
    /// Absolute VR track position.
    pub position: f64,
    /// Cumulative lick count.
    pub lick_count: u64,
    /// Cumulative valve pulse count.
    pub valve_pulses: u64,
    /// Cumulative puff count.
    pub puff_count: u64,
    /// Cumulative imaging frame count.
    pub frame_count: u64,
    /// Windowed running-speed estimate, in cm/s.
    pub running_speed_cm_s: f64,
}

/// Body of a [`LogEventCode::TrialOutcome`] record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrialOutcomeRecord {
    /// Index of the finished trial within the session plan.
    pub index: usize,
    /// Kind of the finished trial.
    pub kind: crate::config::TrialKind,
    /// Whether the trial counts as succeeded.
    pub succeeded: bool,
    /// Whether the trial ran in guidance mode.
    pub guided: bool,
}

/// Append-only sink for session records.
pub trait DataLogger: Send {
    /// Appends one record to the stream.
    fn append(&mut self, record: LogRecord);
}

/// In-memory logger used by tests and the demo runner.
#[derive(Clone, Default)]
pub struct MemoryLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryLogger {
    /// Creates an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records appended so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Number of records carrying the given code.
    pub fn count_with_code(&self, code: LogEventCode) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.code() == Some(code as u8))
            .count()
    }
}

impl DataLogger for MemoryLogger {
    fn append(&mut self, record: LogRecord) {
        self.records.lock().push(record);
    }
}
