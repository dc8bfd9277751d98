//! Load-cell tare and span calibration.
//!
//! Only allowed while the device is in `Calibrating`; the monitoring path
//! never touches the load-cell gain.
use std::time::Duration;

use drip_config::PersistedCalibration;
use drip_traits::LoadCell;
use eyre::WrapErr;
use tracing::{debug, info};

use crate::error::{MonitorError, Result};
use crate::hw_error::map_boxed;
use crate::state::{DeviceState, StateMachine};

/// Raw reads averaged for a tare.
pub const TARE_SAMPLES: usize = 20;

pub struct Calibrator<'a> {
    machine: &'a StateMachine,
    samples: usize,
    timeout: Duration,
}

impl<'a> Calibrator<'a> {
    pub fn new(machine: &'a StateMachine, timeout: Duration) -> Self {
        Self {
            machine,
            samples: TARE_SAMPLES,
            timeout,
        }
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(1);
        self
    }

    fn ensure_calibrating(&self) -> Result<()> {
        let state = self.machine.current();
        if state != DeviceState::Calibrating {
            return Err(MonitorError::State(format!(
                "calibration requires CALIBRATING, device is {state}"
            ))
            .into());
        }
        Ok(())
    }

    /// Mean of `samples` raw conversions. Tolerates up to as many failed
    /// reads as requested samples before giving up.
    fn average_raw(&self, cell: &mut dyn LoadCell) -> Result<i32> {
        let mut sum: i64 = 0;
        let mut got = 0usize;
        let mut failures = 0usize;
        while got < self.samples {
            match cell.read_raw(self.timeout) {
                Ok(raw) => {
                    sum += i64::from(raw);
                    got += 1;
                }
                Err(e) => {
                    failures += 1;
                    let mapped = map_boxed(&e);
                    debug!(error = %mapped, failures, "calibration read failed");
                    if failures > self.samples {
                        return Err(eyre::Report::new(mapped).wrap_err(format!(
                            "only {got} of {} calibration reads succeeded",
                            self.samples
                        )));
                    }
                }
            }
        }
        Ok((sum as f64 / got as f64).round() as i32)
    }

    /// Zero point with the reservoir hook empty.
    pub fn tare(&self, cell: &mut dyn LoadCell) -> Result<i32> {
        self.ensure_calibrating()?;
        let offset = self.average_raw(cell).wrap_err("tare failed")?;
        info!(offset_counts = offset, samples = self.samples, "tare complete");
        Ok(offset)
    }

    /// Scale from a known reference mass hung after `tare`.
    pub fn span(
        &self,
        cell: &mut dyn LoadCell,
        offset_counts: i32,
        known_mass_g: f32,
    ) -> Result<PersistedCalibration> {
        self.ensure_calibrating()?;
        if !(known_mass_g.is_finite() && known_mass_g > 0.0) {
            return Err(MonitorError::Config(format!(
                "reference mass must be > 0 g, got {known_mass_g}"
            ))
            .into());
        }
        let loaded = self.average_raw(cell).wrap_err("span read failed")?;
        let delta = i64::from(loaded) - i64::from(offset_counts);
        if delta == 0 {
            return Err(MonitorError::HardwareFault(
                "reference mass produced no change in counts".into(),
            )
            .into());
        }
        let cal = PersistedCalibration {
            offset_counts,
            scale_g_per_count: known_mass_g / delta as f32,
        };
        info!(
            offset_counts,
            scale_g_per_count = cal.scale_g_per_count,
            "span calibration complete"
        );
        Ok(cal)
    }

    /// Install a calibration on the cell.
    pub fn apply(&self, cell: &mut dyn LoadCell, cal: &PersistedCalibration) -> Result<()> {
        self.ensure_calibrating()?;
        cell.set_calibration(cal.offset_counts, cal.scale_g_per_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{NoopLoadCell, NullClamp};
    use drip_traits::BoxError;

    struct FixedRaw(i32);

    impl LoadCell for FixedRaw {
        fn is_ready(&mut self) -> bool {
            true
        }
        fn read_grams(&mut self, _t: Duration) -> std::result::Result<f32, BoxError> {
            Ok(0.0)
        }
        fn read_raw(&mut self, _t: Duration) -> std::result::Result<i32, BoxError> {
            Ok(self.0)
        }
        fn set_calibration(&mut self, _o: i32, _s: f32) {}
    }

    fn calibrating() -> StateMachine {
        let m = StateMachine::new(Box::new(NullClamp));
        m.transition(DeviceState::Calibrating).unwrap();
        m
    }

    #[test]
    fn refuses_outside_calibrating() {
        let m = StateMachine::new(Box::new(NullClamp));
        let c = Calibrator::new(&m, Duration::from_millis(10));
        let err = c.tare(&mut FixedRaw(5)).unwrap_err();
        assert!(format!("{err}").contains("CALIBRATING"));
    }

    #[test]
    fn tare_then_span() {
        let m = calibrating();
        let c = Calibrator::new(&m, Duration::from_millis(10)).with_samples(4);
        let offset = c.tare(&mut FixedRaw(1_000)).unwrap();
        assert_eq!(offset, 1_000);
        let cal = c.span(&mut FixedRaw(3_000), offset, 500.0).unwrap();
        assert!((cal.scale_g_per_count - 0.25).abs() < 1e-6);
    }

    #[test]
    fn dead_cell_gives_up() {
        let m = calibrating();
        let c = Calibrator::new(&m, Duration::from_millis(1)).with_samples(3);
        assert!(c.tare(&mut NoopLoadCell).is_err());
    }

    #[test]
    fn zero_reference_mass_is_config_error() {
        let m = calibrating();
        let c = Calibrator::new(&m, Duration::from_millis(1)).with_samples(1);
        assert!(c.span(&mut FixedRaw(10), 0, 0.0).is_err());
    }
}
