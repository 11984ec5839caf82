//! Custom error types for the session coordinator.
//!
//! This module defines the primary error type, `CoordinatorError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures a session can encounter, from configuration issues
//! to hardware and transport faults.
//!
//! ## Error Hierarchy
//!
//! `CoordinatorError` is an enum that consolidates the error taxonomy of the runtime:
//!
//! - **`Config`**: Wraps errors from the `config` crate, typically related to file
//!   parsing or format issues in the experiment configuration files.
//! - **`Configuration`**: Represents semantic errors in the configuration, such as
//!   values that parse but are logically invalid (e.g., an empty trial motif). These
//!   are caught by the validation step before a session starts.
//! - **`Hardware`**: A read or write against a hardware channel failed. Hardware
//!   faults are never retried inside the control loop; they force immediate
//!   termination of the session.
//! - **`HandshakeTimeout`**: The VR engine did not acknowledge a required setup
//!   request (e.g., the cue-sequence handshake) within the bounded retry window.
//! - **`Transport`**: A publish against the VR engine transport failed outside of
//!   the handshake path.
//! - **`ImagingStale`**: The imaging subsystem stopped producing frames for longer
//!   than the configured delay. Fatal, with no auto-recovery.
//! - **`InvalidTransition`**: A caller requested a system-state transition that the
//!   transition table does not permit (e.g., any transition after termination).
//!
//! All fatal conditions funnel through the coordinator's termination path, which
//! commands the hardware to a safe state before the error is surfaced to the caller.

use thiserror::Error;

use crate::session::SystemState;

/// Convenience alias for results using the coordinator error type.
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

/// Unified error type for session setup and runtime failures.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Hardware channel error on '{channel}': {message}")]
    Hardware {
        /// Name of the channel or actuator that failed.
        channel: &'static str,
        /// Collaborator-supplied description of the fault.
        message: String,
    },

    #[error("VR engine did not answer the {request} handshake within {attempts} attempts")]
    HandshakeTimeout {
        /// The handshake request that went unanswered.
        request: &'static str,
        /// How many bounded attempts were made before escalating.
        attempts: u32,
    },

    #[error("VR transport error: {0}")]
    Transport(String),

    #[error("Imaging frames stopped arriving (no frame for {elapsed_ms} ms)")]
    ImagingStale {
        /// Milliseconds since the last observed frame.
        elapsed_ms: u64,
    },

    #[error("Invalid system state transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// State the system was in when the transition was requested.
        from: SystemState,
        /// State the caller asked for.
        to: SystemState,
    },

    #[error("Descriptor persistence error: {0}")]
    Descriptor(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    /// Builds a hardware error for the named channel.
    pub fn hardware(channel: &'static str, message: impl Into<String>) -> Self {
        CoordinatorError::Hardware {
            channel,
            message: message.into(),
        }
    }
}
