//! Hardware-facing seams shared by the monitor core and the drivers.
//!
//! Everything that touches a pin, a bus or a wall clock lives behind one of
//! these traits so the safety path can be exercised deterministically.

pub mod clock;

pub use clock::{Clock, MonotonicClock};

/// Error type crossing trait boundaries; the core maps it to typed errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Weighing collaborator (HX711 or a simulator).
pub trait LoadCell {
    /// True when a fresh conversion is available without waiting.
    fn is_ready(&mut self) -> bool;

    /// Calibrated weight in grams, waiting at most `timeout` for data-ready.
    fn read_grams(&mut self, timeout: std::time::Duration) -> Result<f32, BoxError>;

    /// Raw ADC counts; only used while calibrating.
    fn read_raw(&mut self, timeout: std::time::Duration) -> Result<i32, BoxError>;

    /// Install tare offset and scale. Only called while calibrating.
    fn set_calibration(&mut self, offset_counts: i32, scale_g_per_count: f32);
}

/// Line clamp actuator (servo). Driven only by the state machine.
pub trait ClampActuator {
    /// Move to the position that pinches the line shut.
    fn clamp(&mut self) -> Result<(), BoxError>;
    /// Move back to the open position.
    fn release(&mut self) -> Result<(), BoxError>;
    /// Stop driving the actuator (holds position mechanically, no jitter).
    fn detach(&mut self) -> Result<(), BoxError>;
}

impl<T: LoadCell + ?Sized> LoadCell for Box<T> {
    fn is_ready(&mut self) -> bool {
        (**self).is_ready()
    }
    fn read_grams(&mut self, timeout: std::time::Duration) -> Result<f32, BoxError> {
        (**self).read_grams(timeout)
    }
    fn read_raw(&mut self, timeout: std::time::Duration) -> Result<i32, BoxError> {
        (**self).read_raw(timeout)
    }
    fn set_calibration(&mut self, offset_counts: i32, scale_g_per_count: f32) {
        (**self).set_calibration(offset_counts, scale_g_per_count);
    }
}

impl<T: ClampActuator + ?Sized> ClampActuator for Box<T> {
    fn clamp(&mut self) -> Result<(), BoxError> {
        (**self).clamp()
    }
    fn release(&mut self) -> Result<(), BoxError> {
        (**self).release()
    }
    fn detach(&mut self) -> Result<(), BoxError> {
        (**self).detach()
    }
}
