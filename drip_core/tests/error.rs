use drip_core::error::MonitorError;
use drip_core::hw_error::{map_boxed, map_hw_error};
use drip_hardware::error::HwError;
use drip_traits::BoxError;

#[test]
fn hardware_timeouts_map_to_timeout() {
    for e in [HwError::Timeout, HwError::DataReadyTimeout] {
        assert!(matches!(map_hw_error(&e), MonitorError::Timeout));
    }
}

#[test]
fn other_hardware_errors_are_faults() {
    let boxed: BoxError = Box::new(HwError::Pwm("servo did not respond".into()));
    match map_boxed(&boxed) {
        MonitorError::HardwareFault(msg) => assert!(msg.contains("servo did not respond")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        map_hw_error(&HwError::AngleOutOfRange(200)),
        MonitorError::HardwareFault(_)
    ));
}

#[test]
fn foreign_errors_fall_back_to_message() {
    let io = std::io::Error::other("i2c read timeout");
    assert!(matches!(map_hw_error(&io), MonitorError::Timeout));
    let io = std::io::Error::other("bus glitch");
    match map_hw_error(&io) {
        MonitorError::Hardware(msg) => assert_eq!(msg, "bus glitch"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn monitor_error_messages() {
    assert_eq!(MonitorError::Timeout.to_string(), "timeout waiting for sensor");
    assert_eq!(
        MonitorError::State("x".into()).to_string(),
        "invalid state: x"
    );
}
