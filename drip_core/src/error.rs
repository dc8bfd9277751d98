use thiserror::Error;

use crate::bus::Topic;
use crate::state::DeviceState;

#[derive(Debug, Error, Clone)]
pub enum MonitorError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timeout waiting for sensor")]
    Timeout,
    #[error("invalid state: {0}")]
    State(String),
}

/// Why `StateMachine::transition` did not land on the requested state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// Pair not in the transition table; the current state is unchanged.
    #[error("transition {from} -> {to} is not allowed")]
    Rejected { from: DeviceState, to: DeviceState },
    /// The clamp command failed; the machine fell through to `Error`.
    #[error("clamp actuator failed while entering {to}: {reason}")]
    Actuator { to: DeviceState, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("topic {topic} already has {max} subscribers")]
    TopicFull { topic: Topic, max: usize },
    #[error("payload for {payload} published on topic {topic}")]
    PayloadMismatch { topic: Topic, payload: Topic },
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(String),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
