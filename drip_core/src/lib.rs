#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core IV-drip monitoring logic (hardware-agnostic).
//!
//! All hardware interactions go through `drip_traits::LoadCell` and
//! `drip_traits::ClampActuator`; time goes through `drip_traits::Clock`.
//!
//! ## Architecture
//!
//! - **Filtering**: EMA with an optional 1-D Kalman stage (`filter`)
//! - **Flow**: windowed rate and time-to-empty (`flow`)
//! - **Safety**: debounced low-fluid, free-flow, stall and air detectors (`safety`)
//! - **State**: validated transition table and clamp side effects (`state`)
//! - **Bus**: bounded per-subscriber queues, never blocking the producer (`bus`)
//! - **Loop**: one deterministic cycle plus a paced runner (`monitor`)
//! - **Supervision**: sampler thread and software watchdog (`sampler`, `watchdog`)

pub mod bus;
pub mod calibration;
pub mod config;
pub mod conversions;
pub mod error;
pub mod filter;
pub mod flow;
pub mod hw_error;
pub mod mocks;
pub mod monitor;
pub mod safety;
pub mod sampler;
pub mod state;
pub mod types;
pub mod util;
pub mod watchdog;

pub use bus::{Event, EventBus, Payload, Subscription, Topic};
pub use config::MonitorCfg;
pub use error::{BusError, MonitorError, Result, TransitionError};
pub use flow::{FlowCalculator, FlowData};
pub use monitor::{CycleReport, MonitorLoop};
pub use safety::{SafetyEvaluator, SafetyEvent, SafetyInputs};
pub use state::{DeviceState, Request, StateMachine, Transition};
pub use types::{AlarmKind, DeviceStatus, WeightReading};
