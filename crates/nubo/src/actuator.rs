use alloc::string::String;

use serde::{Deserialize, Serialize};

/// A request addressed to a single actuator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActuationRequest {
    /// Sets the actuator to a new value.
    Set {
        /// The requested value.
        #[serde(default)]
        value: String,
    },
    /// Asks for the current actuator status.
    Status,
}

/// An [`ActuationRequest`] together with the reference of the target
/// actuator.
///
/// The reference is not part of the payload, it is the last level of the
/// channel the request arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorCommand {
    /// Actuator reference.
    pub reference: String,
    /// Actuation request.
    pub request: ActuationRequest,
}

impl ActuatorCommand {
    /// Creates an [`ActuatorCommand`].
    #[must_use]
    #[inline]
    pub fn new(reference: impl Into<String>, request: ActuationRequest) -> Self {
        Self {
            reference: reference.into(),
            request,
        }
    }
}

/// Actuator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActuatorState {
    /// The actuator is idle and holds its value.
    Ready,
    /// The actuator is moving towards a new value.
    Busy,
    /// The actuator is faulty.
    Error,
}

/// The status of an actuator, published after every actuation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorStatus {
    /// Actuator state.
    pub status: ActuatorState,
    /// Current actuator value.
    pub value: String,
}

impl ActuatorStatus {
    /// Creates an [`ActuatorStatus`].
    #[must_use]
    #[inline]
    pub fn new(status: ActuatorState, value: impl Into<String>) -> Self {
        Self {
            status,
            value: value.into(),
        }
    }
}
