use std::time::Duration;

use drip_core::calibration::Calibrator;
use drip_core::mocks::NullClamp;
use drip_core::state::{DeviceState, Request, StateMachine};
use drip_hardware::sim::{SIM_SCALE_G_PER_COUNT, SIM_TARE_COUNTS, SimulatedLoadCell};
use drip_traits::LoadCell;

fn calibrating() -> StateMachine {
    let m = StateMachine::new(Box::new(NullClamp));
    m.request(Request::StartCalibration).unwrap();
    m
}

#[test]
fn tare_and_span_recover_the_simulated_gain() {
    let m = calibrating();
    let (mut cell, handle) = SimulatedLoadCell::draining(0.0, 0.0);
    let cal = Calibrator::new(&m, Duration::from_millis(10)).with_samples(8);

    let offset = cal.tare(&mut cell).unwrap();
    assert_eq!(offset, SIM_TARE_COUNTS);

    handle.set_weight(500.0);
    let result = cal.span(&mut cell, offset, 500.0).unwrap();
    assert!((result.scale_g_per_count - SIM_SCALE_G_PER_COUNT).abs() < 1e-6);

    cal.apply(&mut cell, &result).unwrap();
    let g = cell.read_grams(Duration::from_millis(10)).unwrap();
    assert!((g - 500.0).abs() < 0.01, "g = {g}");

    m.request(Request::FinishCalibration).unwrap();
    assert_eq!(m.current(), DeviceState::Idle);
    assert!(cal.tare(&mut cell).is_err());
}

#[test]
fn flaky_cell_still_calibrates() {
    let m = calibrating();
    let (mut cell, handle) = SimulatedLoadCell::draining(0.0, 0.0);
    handle.set_failing(true);
    let cal = Calibrator::new(&m, Duration::from_millis(1)).with_samples(4);
    let err = cal.tare(&mut cell).unwrap_err();
    assert!(format!("{err:#}").contains("tare failed"));

    handle.set_failing(false);
    assert!(cal.tare(&mut cell).is_ok());
}
