use std::fs;
use std::path::PathBuf;

/// Minimal config tuned so simulated runs reach a verdict within seconds.
pub fn write_fast_config(dir: &tempfile::TempDir) -> PathBuf {
    let toml = r#"
[sampling]
sample_rate_hz = 10
sensor_timeout_ms = 50
max_stale_cycles = 3

[filter]
ema_alpha = 0.5

[flow]
# short window so a rate exists after half a second
window_samples = 5
fluid = "water"
expected_rate_ml_min = 100.0

[safety]
free_flow_debounce = 5

[display]
refresh_ms = 200

[telemetry]
publish_interval_ms = 200
device_id = "bench-01"
"#;
    let path = dir.path().join("cfg.toml");
    fs::write(&path, toml).unwrap();
    path
}
