use assert_cmd::prelude::*;
use rstest::rstest;
use serde_json::Value;
use std::process::Command;
use tempfile::tempdir;

mod common;
use common::write_fast_config;

fn json_lines(bytes: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap_or_else(|e| panic!("not JSON ({e}): {l}")))
        .collect()
}

/// Telemetry lines followed by one result line for a clean run.
#[rstest]
fn jsonl_telemetry_and_result_schema() {
    let dir = tempdir().unwrap();
    let cfg = write_fast_config(&dir);

    let out = Command::cargo_bin("dripsense")
        .unwrap()
        .arg("--json")
        .arg("--log-level")
        .arg("error")
        .arg("--config")
        .arg(&cfg)
        .args(["monitor", "--duration-s", "1.5"])
        .output()
        .unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let lines = json_lines(&out.stdout);
    let (result, telemetry) = lines.split_last().expect("at least the result line");
    assert_eq!(result["type"], "result");
    assert_eq!(result["device_id"], "bench-01");
    assert_eq!(result["state"], "MONITORING");
    assert_eq!(result["alarm"], "none");
    assert!(result["cycles"].as_u64().unwrap() > 5);
    assert!(result["overruns"].is_u64());

    assert!(!telemetry.is_empty(), "no telemetry published");
    for t in telemetry {
        assert_eq!(t["type"], "telemetry");
        for key in ["uptime_s", "state", "alarm", "weight_g", "flow_ml_min", "eta_min", "wifi"] {
            assert!(t.get(key).is_some(), "missing {key} in {t}");
        }
    }
    let last = telemetry.last().unwrap();
    assert!(last["weight_g"].as_f64().unwrap() < 500.0);
}

/// An alarm at the end of a run produces a structured error on stderr.
#[rstest]
fn jsonl_error_schema_for_free_flow() {
    let dir = tempdir().unwrap();
    let cfg = write_fast_config(&dir);

    let out = Command::cargo_bin("dripsense")
        .unwrap()
        .arg("--json")
        .arg("--log-level")
        .arg("off")
        .arg("--config")
        .arg(&cfg)
        .args(["monitor", "--duration-s", "4", "--sim-drain-g-per-s", "60"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(4));

    let result = json_lines(&out.stdout).pop().expect("result line");
    assert_eq!(result["state"], "CLAMPED");
    assert_eq!(result["alarm"], "free_flow");

    let err = json_lines(&out.stderr).pop().expect("error line");
    assert_eq!(err["type"], "error");
    assert_eq!(err["reason"], "Alarm");
    assert_eq!(err["alarm"], "free_flow");
    assert!(err["message"].as_str().unwrap().contains("What happened"));
}

#[rstest]
fn transitions_as_json() {
    let out = Command::cargo_bin("dripsense")
        .unwrap()
        .args(["--json", "transitions"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["IDLE"], serde_json::json!(["CALIBRATING", "MONITORING"]));
    assert_eq!(v["ERROR"], serde_json::json!(["IDLE"]));
    assert_eq!(v.as_object().unwrap().len(), 9);
}
