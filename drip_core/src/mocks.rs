//! Test and helper mocks for drip_core

use std::time::Duration;

use drip_traits::{BoxError, ClampActuator, LoadCell};

/// A load cell that always errors; useful when driving the loop with
/// externally supplied readings via `MonitorLoop::cycle`.
pub struct NoopLoadCell;

impl LoadCell for NoopLoadCell {
    fn is_ready(&mut self) -> bool {
        false
    }

    fn read_grams(&mut self, _timeout: Duration) -> Result<f32, BoxError> {
        Err(Box::new(std::io::Error::other("noop load cell")))
    }

    fn read_raw(&mut self, _timeout: Duration) -> Result<i32, BoxError> {
        Err(Box::new(std::io::Error::other("noop load cell")))
    }

    fn set_calibration(&mut self, _offset_counts: i32, _scale_g_per_count: f32) {}
}

/// Clamp that accepts every command and does nothing.
pub struct NullClamp;

impl ClampActuator for NullClamp {
    fn clamp(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn release(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn detach(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}
