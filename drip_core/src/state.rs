//! Device state machine.
//!
//! One authoritative `DeviceState`, changed only through
//! [`StateMachine::transition`], which validates against a fixed table:
//!
//! ```text
//! Idle        -> Calibrating, Monitoring
//! Calibrating -> Monitoring, Idle, Error
//! Monitoring  -> LowFluid, FreeFlow, AirDetect, Idle, Error, OtaUpdate
//! LowFluid    -> Monitoring, Clamped, Error
//! FreeFlow    -> Clamped, Monitoring, Error
//! AirDetect   -> Clamped, Error
//! Clamped     -> Idle, Error
//! Error       -> Idle
//! OtaUpdate   -> Monitoring, Error
//! ```
//!
//! Entering `Clamped` drives the clamp actuator. The clamp stays engaged
//! through `Error` and is released and detached only on the way to `Idle`,
//! which needs an operator stop or reset. The machine is shared behind an `Arc` and guarded by a mutex, so
//! the monitoring loop and external requesters go through the same gate.
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use drip_traits::ClampActuator;
use tracing::{error, info, warn};

use crate::error::TransitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DeviceState {
    #[default]
    Idle = 0,
    Calibrating = 1,
    Monitoring = 2,
    LowFluid = 3,
    FreeFlow = 4,
    AirDetect = 5,
    Clamped = 6,
    Error = 7,
    OtaUpdate = 8,
}

use DeviceState as S;

impl DeviceState {
    pub const COUNT: usize = 9;

    pub const ALL: [DeviceState; Self::COUNT] = [
        S::Idle,
        S::Calibrating,
        S::Monitoring,
        S::LowFluid,
        S::FreeFlow,
        S::AirDetect,
        S::Clamped,
        S::Error,
        S::OtaUpdate,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            S::Idle => "IDLE",
            S::Calibrating => "CALIBRATING",
            S::Monitoring => "MONITORING",
            S::LowFluid => "LOW_FLUID",
            S::FreeFlow => "FREE_FLOW",
            S::AirDetect => "AIR_DETECT",
            S::Clamped => "CLAMPED",
            S::Error => "ERROR",
            S::OtaUpdate => "OTA_UPDATE",
        }
    }

    /// Legal targets from this state.
    pub const fn allowed_targets(self) -> &'static [DeviceState] {
        match self {
            S::Idle => &[S::Calibrating, S::Monitoring],
            S::Calibrating => &[S::Monitoring, S::Idle, S::Error],
            S::Monitoring => &[
                S::LowFluid,
                S::FreeFlow,
                S::AirDetect,
                S::Idle,
                S::Error,
                S::OtaUpdate,
            ],
            S::LowFluid => &[S::Monitoring, S::Clamped, S::Error],
            S::FreeFlow => &[S::Clamped, S::Monitoring, S::Error],
            S::AirDetect => &[S::Clamped, S::Error],
            S::Clamped => &[S::Idle, S::Error],
            S::Error => &[S::Idle],
            S::OtaUpdate => &[S::Monitoring, S::Error],
        }
    }

    pub fn can_transition_to(self, to: DeviceState) -> bool {
        self.allowed_targets().contains(&to)
    }

    /// States in which fluid may be flowing and the detectors must run.
    pub const fn is_infusing(self) -> bool {
        matches!(self, S::Monitoring | S::LowFluid | S::FreeFlow | S::AirDetect)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A transition that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DeviceState,
    pub to: DeviceState,
}

/// Transition requests from outside the monitoring loop (buttons, network,
/// calibration and update tooling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    StartCalibration,
    FinishCalibration,
    StartMonitoring,
    Stop,
    ManualReset,
    OtaRequest,
    OtaComplete,
}

impl Request {
    pub const fn target(self) -> DeviceState {
        match self {
            Request::StartCalibration => S::Calibrating,
            Request::FinishCalibration | Request::Stop | Request::ManualReset => S::Idle,
            Request::StartMonitoring | Request::OtaComplete => S::Monitoring,
            Request::OtaRequest => S::OtaUpdate,
        }
    }
}

struct Inner {
    current: DeviceState,
    actuator: Box<dyn ClampActuator + Send>,
    transitions: u64,
    /// Set once a clamp command has been issued; cleared on release.
    clamp_engaged: bool,
}

pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl StateMachine {
    /// Starts in `Idle`.
    pub fn new(actuator: Box<dyn ClampActuator + Send>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: S::Idle,
                actuator,
                transitions: 0,
                clamp_engaged: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is a plain enum; a panic elsewhere cannot leave it half-written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> DeviceState {
        self.lock().current
    }

    pub fn name(&self) -> &'static str {
        self.current().name()
    }

    /// Number of transitions applied since construction.
    pub fn transition_count(&self) -> u64 {
        self.lock().transitions
    }

    /// Validate and apply `from -> to`.
    ///
    /// Rejected pairs leave the state untouched. If the clamp itself fails,
    /// the machine ends in `Error` and `TransitionError::Actuator` is returned.
    pub fn transition(&self, to: DeviceState) -> Result<Transition, TransitionError> {
        let mut inner = self.lock();
        let from = inner.current;
        if !from.can_transition_to(to) {
            return Err(TransitionError::Rejected { from, to });
        }

        if to == S::Idle && inner.clamp_engaged {
            // A line left shut is safe, so a failed release still leaves the state.
            if let Err(e) = inner.actuator.release() {
                error!(error = %e, from = %from, "clamp release failed");
            }
            if let Err(e) = inner.actuator.detach() {
                warn!(error = %e, "clamp detach failed");
            }
            inner.clamp_engaged = false;
        } else if from == S::Clamped {
            info!(to = %to, "clamp held engaged");
        }

        inner.current = to;
        inner.transitions += 1;

        if to == S::Clamped {
            // A stuck servo may still have moved; release it on reset anyway.
            inner.clamp_engaged = true;
            if let Err(e) = inner.actuator.clamp() {
                error!(error = %e, from = %from, "clamp command failed; entering ERROR");
                inner.current = S::Error;
                inner.transitions += 1;
                return Err(TransitionError::Actuator {
                    to,
                    reason: e.to_string(),
                });
            }
        }

        info!(from = %from, to = %to, "state transition");
        Ok(Transition { from, to })
    }

    pub fn request(&self, req: Request) -> Result<Transition, TransitionError> {
        info!(?req, "transition requested");
        self.transition(req.target())
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
