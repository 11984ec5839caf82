//! VR engine transport capability.
//!
//! The coordinator and the VR engine exchange messages over a publish/subscribe
//! channel keyed by named topics: the coordinator publishes movement deltas, scene
//! selection, and guidance toggles, and subscribes to the cue sequence, reward-zone
//! entries, lick echoes, and engine termination. The transport itself (broker,
//! sockets, reconnects) is an external collaborator; this module only defines the
//! topic vocabulary, the JSON payload shapes, and the non-blocking trait the control
//! loop drains once per cycle.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::TrialKind;
use crate::error::{CoordinatorError, CoordinatorResult};

/// Named topics of the coordinator/VR-engine channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VrTopic {
    /// Coordinator -> engine: start the VR session scene.
    SessionStart,
    /// Bidirectional: engine announces (or coordinator requests) session stop.
    SessionStop,
    /// Engine -> coordinator: the wall-cue sequence of the loaded scene.
    CueSequence,
    /// Coordinator -> engine: request the wall-cue sequence.
    CueSequenceRequest,
    /// Coordinator -> engine: animal movement delta along the track.
    Movement,
    /// Coordinator -> engine: a lick was detected.
    Lick,
    /// Engine -> coordinator: the animal entered the active reward zone.
    RewardZoneEntry,
    /// Coordinator -> engine: toggle reward-trial guidance.
    RewardGuidance,
    /// Coordinator -> engine: toggle aversive-trial guidance.
    AversiveGuidance,
    /// Coordinator -> engine: show or hide the reward-zone boundary marker.
    RewardZoneMarker,
}

impl VrTopic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            VrTopic::SessionStart => "session/start",
            VrTopic::SessionStop => "session/stop",
            VrTopic::CueSequence => "cue_sequence/data",
            VrTopic::CueSequenceRequest => "cue_sequence/request",
            VrTopic::Movement => "track/movement",
            VrTopic::Lick => "track/lick",
            VrTopic::RewardZoneEntry => "track/reward_zone",
            VrTopic::RewardGuidance => "guidance/reward",
            VrTopic::AversiveGuidance => "guidance/aversive",
            VrTopic::RewardZoneMarker => "guidance/marker",
        }
    }

    /// Guidance topic for the given trial kind.
    pub fn guidance_for(kind: TrialKind) -> Self {
        match kind {
            TrialKind::Reward => VrTopic::RewardGuidance,
            TrialKind::Aversive => VrTopic::AversiveGuidance,
        }
    }
}

/// One message received from the VR engine.
#[derive(Clone, Debug)]
pub struct TransportMessage {
    /// Topic the message arrived on.
    pub topic: VrTopic,
    /// Raw payload bytes (JSON for all defined topics).
    pub payload: Vec<u8>,
}

/// Payload of [`VrTopic::CueSequence`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CueSequencePayload {
    /// Ordered wall-cue identifiers for the loaded scene.
    pub cue_sequence: Vec<u8>,
}

/// Payload of [`VrTopic::Movement`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MovementPayload {
    /// Position delta since the previous update, in track units.
    pub movement: f64,
}

/// Payload of the guidance and marker toggle topics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TogglePayload {
    /// New state of the toggled feature.
    pub enabled: bool,
}

/// Non-blocking publish/subscribe transport to the VR engine.
pub trait VrTransport: Send {
    /// Publishes a message. Failures are transport faults, not handshake timeouts.
    fn publish(&mut self, topic: VrTopic, payload: &[u8]) -> CoordinatorResult<()>;

    /// Pops the next pending inbound message, if any. Never blocks.
    fn try_recv(&mut self) -> Option<TransportMessage>;
}

// =============================================================================
// Mock Transport
// =============================================================================

/// Scriptable in-memory transport for tests.
///
/// Tests push inbound messages with [`MockTransport::push_inbound`] and inspect
/// everything the coordinator published via [`MockTransport::published`]. When a
/// cue sequence is scripted with [`MockTransport::respond_with_cues`], each
/// published [`VrTopic::CueSequenceRequest`] is answered by queueing the sequence
/// as an inbound message, emulating a responsive engine during the handshake.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportState>>,
}

#[derive(Default)]
struct MockTransportState {
    inbound: VecDeque<TransportMessage>,
    published: Vec<(VrTopic, Vec<u8>)>,
    cue_response: Option<Vec<u8>>,
    fail_publish: bool,
}

impl MockTransport {
    /// Creates an empty transport with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an inbound message for the coordinator to drain.
    pub fn push_inbound(&self, topic: VrTopic, payload: Vec<u8>) {
        self.inner
            .lock()
            .inbound
            .push_back(TransportMessage { topic, payload });
    }

    /// Queues an inbound reward-zone entry notification.
    pub fn push_reward_zone_entry(&self) {
        self.push_inbound(VrTopic::RewardZoneEntry, Vec::new());
    }

    /// Queues an inbound engine-termination notification.
    pub fn push_termination(&self) {
        self.push_inbound(VrTopic::SessionStop, Vec::new());
    }

    /// Scripts the engine to answer cue-sequence requests with `cues`.
    pub fn respond_with_cues(&self, cues: Vec<u8>) {
        self.inner.lock().cue_response = Some(cues);
    }

    /// Stops answering cue-sequence requests, emulating a hung engine.
    pub fn stop_responding(&self) {
        self.inner.lock().cue_response = None;
    }

    /// Makes all subsequent publishes fail.
    pub fn fail_publishes(&self) {
        self.inner.lock().fail_publish = true;
    }

    /// All `(topic, payload)` pairs published so far.
    pub fn published(&self) -> Vec<(VrTopic, Vec<u8>)> {
        self.inner.lock().published.clone()
    }

    /// Number of messages published to `topic`.
    pub fn published_count(&self, topic: VrTopic) -> usize {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(t, _)| *t == topic)
            .count()
    }
}

impl VrTransport for MockTransport {
    fn publish(&mut self, topic: VrTopic, payload: &[u8]) -> CoordinatorResult<()> {
        let mut state = self.inner.lock();
        if state.fail_publish {
            return Err(CoordinatorError::Transport(format!(
                "publish to '{}' failed",
                topic.as_str()
            )));
        }
        state.published.push((topic, payload.to_vec()));

        if topic == VrTopic::CueSequenceRequest {
            if let Some(cues) = state.cue_response.clone() {
                let payload = serde_json::to_vec(&CueSequencePayload { cue_sequence: cues })
                    .map_err(|e| CoordinatorError::Transport(e.to_string()))?;
                state.inbound.push_back(TransportMessage {
                    topic: VrTopic::CueSequence,
                    payload,
                });
            }
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Option<TransportMessage> {
        self.inner.lock().inbound.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_wire_names_are_unique() {
        let topics = [
            VrTopic::SessionStart,
            VrTopic::SessionStop,
            VrTopic::CueSequence,
            VrTopic::CueSequenceRequest,
            VrTopic::Movement,
            VrTopic::Lick,
            VrTopic::RewardZoneEntry,
            VrTopic::RewardGuidance,
            VrTopic::AversiveGuidance,
            VrTopic::RewardZoneMarker,
        ];
        let mut names: Vec<&str> = topics.iter().map(VrTopic::as_str).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), topics.len());
    }

    #[test]
    fn test_mock_transport_answers_cue_requests() {
        let mut transport = MockTransport::new();
        transport.respond_with_cues(vec![1, 2, 3]);

        transport.publish(VrTopic::CueSequenceRequest, &[]).unwrap();
        let message = transport.try_recv().unwrap();
        assert_eq!(message.topic, VrTopic::CueSequence);

        let payload: CueSequencePayload = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(payload.cue_sequence, vec![1, 2, 3]);
    }

    #[test]
    fn test_mock_transport_silent_without_script() {
        let mut transport = MockTransport::new();
        transport.publish(VrTopic::CueSequenceRequest, &[]).unwrap();
        assert!(transport.try_recv().is_none());
    }

    #[test]
    fn test_mock_transport_records_publishes() {
        let mut transport = MockTransport::new();
        let payload = serde_json::to_vec(&MovementPayload { movement: 1.5 }).unwrap();
        transport.publish(VrTopic::Movement, &payload).unwrap();

        assert_eq!(transport.published_count(VrTopic::Movement), 1);
        assert_eq!(transport.published()[0].0, VrTopic::Movement);
    }

    #[test]
    fn test_publish_failure_injection() {
        let mut transport = MockTransport::new();
        transport.fail_publishes();
        assert!(transport.publish(VrTopic::SessionStart, &[]).is_err());
    }
}
