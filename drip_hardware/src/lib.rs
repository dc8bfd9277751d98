//! Drivers for the drip monitor: servo clamp, HX711 load cell, and
//! simulated stand-ins used by the CLI and tests.
pub mod error;
#[cfg(feature = "hardware")]
pub mod hx711;
pub mod servo;
pub mod sim;
pub mod util;

pub use error::HwError;
pub use servo::{PulseOutput, ServoClamp, ServoPositions, angle_to_pulse_us};
pub use sim::{ClampCommand, ClampLog, SimHandle, SimulatedClamp, SimulatedLoadCell};
