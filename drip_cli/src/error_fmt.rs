//! Human-readable error descriptions, exit codes and structured JSON errors.

use drip_core::error::{BusError, MonitorError, TransitionError};
use drip_core::{AlarmKind, DeviceState};
use drip_hardware::HwError;
use serde_json::json;

use crate::monitor::MonitorEnded;

/// Exit code used when the software watchdog expires.
pub const WATCHDOG_EXIT_CODE: i32 = 70;
pub const CONFIG_EXIT_CODE: i32 = 10;
pub const HARDWARE_EXIT_CODE: i32 = 11;
pub const STATE_EXIT_CODE: i32 = 12;

/// Stable exit code for a run that ended with `alarm` raised.
pub const fn alarm_exit_code(alarm: AlarmKind) -> i32 {
    match alarm {
        AlarmKind::None => 0,
        AlarmKind::LowFluid => 3,
        AlarmKind::FreeFlow => 4,
        AlarmKind::FlowStall => 5,
        AlarmKind::AirDetect => 6,
        AlarmKind::SensorFail => 7,
    }
}

fn alarm_help(alarm: AlarmKind, state: DeviceState) -> String {
    let (what, fix) = match alarm {
        AlarmKind::None => ("no alarm", "Nothing to do."),
        AlarmKind::LowFluid => (
            "the bag is nearly empty",
            "Replace or top up the bag, then reset the device.",
        ),
        AlarmKind::FreeFlow => (
            "the drip ran far faster than prescribed and the line was clamped",
            "Check the roller clamp and the prescribed rate (--expected-rate / flow.expected_rate_ml_min).",
        ),
        AlarmKind::FlowStall => (
            "the weight stopped dropping",
            "Check for a kinked or occluded line and the cannula site.",
        ),
        AlarmKind::AirDetect => (
            "air was detected in the line and the line was clamped",
            "Purge the line before restarting.",
        ),
        AlarmKind::SensorFail => (
            "the load cell stopped producing readings",
            "Check the HX711 wiring and power; raise sampling.sensor_timeout_ms if readings are slow.",
        ),
    };
    format!("What happened: {what} (device state {state}).\nHow to fix: {fix}")
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(end) = err.downcast_ref::<MonitorEnded>() {
        return alarm_help(end.alarm, end.state);
    }

    if let Some(te) = err.downcast_ref::<TransitionError>() {
        return match te {
            TransitionError::Rejected { from, to } => format!(
                "What happened: The device cannot go from {from} to {to}.\nLikely causes: The command does not apply in the current state.\nHow to fix: Run `dripsense transitions` to see the allowed moves."
            ),
            TransitionError::Actuator { reason, .. } => format!(
                "What happened: The line clamp did not respond ({reason}); the device entered ERROR.\nLikely causes: Servo unpowered, wrong [pins] servo_pwm, or a jammed horn.\nHow to fix: Check the servo wiring and clamp angles, then reset the device."
            ),
        };
    }

    if let Some(me) = err.downcast_ref::<MonitorError>() {
        return match me {
            MonitorError::Timeout => "What happened: Load cell read timed out.\nLikely causes: HX711 not wired correctly, no power/ground, or timeout too low.\nHow to fix: Verify DOUT/SCK pins and power, and consider increasing sampling.sensor_timeout_ms in the config.".to_string(),
            MonitorError::Config(msg) => {
                if msg.to_ascii_lowercase().contains("calibration csv must have headers") {
                    return "Invalid headers in calibration CSV. Expected 'raw,grams'.".to_string();
                }
                format!(
                    "What happened: Invalid configuration ({msg}).\nLikely causes: A missing file, a TOML syntax error, or a value of the wrong type.\nHow to fix: Edit the config file, then rerun. Out-of-range numbers are replaced by defaults and logged as warnings."
                )
            }
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    if let Some(be) = err.downcast_ref::<BusError>() {
        return format!(
            "What happened: {be}.\nHow to fix: This is an internal wiring fault; re-run with --log-level=debug and report it."
        );
    }

    if let Some(hw) = err.downcast_ref::<HwError>() {
        return format!(
            "What happened: Hardware initialisation failed ({hw}).\nLikely causes: Incorrect pin numbers or insufficient GPIO permissions.\nHow to fix: Fix the [pins] values in the config; ensure the process has permission to access GPIO."
        );
    }

    let msg = err.to_string();
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Map typed errors to stable exit codes; anything else is 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if let Some(end) = err.downcast_ref::<MonitorEnded>() {
        return alarm_exit_code(end.alarm);
    }
    if err.downcast_ref::<TransitionError>().is_some() {
        return STATE_EXIT_CODE;
    }
    if err.downcast_ref::<HwError>().is_some() {
        return HARDWARE_EXIT_CODE;
    }
    match err.downcast_ref::<MonitorError>() {
        Some(MonitorError::Config(_)) => CONFIG_EXIT_CODE,
        Some(MonitorError::State(_)) => STATE_EXIT_CODE,
        Some(_) => HARDWARE_EXIT_CODE,
        None => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    let msg = humanize(err);
    if let Some(end) = err.downcast_ref::<MonitorEnded>() {
        return json!({
            "type": "error",
            "reason": "Alarm",
            "alarm": end.alarm.name(),
            "state": end.state.name(),
            "message": msg,
        })
        .to_string();
    }
    let reason = match exit_code_for_error(err) {
        CONFIG_EXIT_CODE => "Config",
        HARDWARE_EXIT_CODE => "Hardware",
        STATE_EXIT_CODE => "State",
        _ => "Error",
    };
    json!({ "type": "error", "reason": reason, "message": msg }).to_string()
}
