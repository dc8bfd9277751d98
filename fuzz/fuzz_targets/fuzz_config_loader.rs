#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse errors are fine; panics are not.
    let Ok(mut cfg) = drip_config::load_toml(data) else {
        return;
    };
    cfg.sanitize();
    // A sanitized config is already in range.
    assert!(cfg.sanitize().is_empty(), "sanitize is not idempotent");
    assert!(cfg.flow.window_samples >= 2);
    assert!(cfg.sampling.sensor_timeout_ms <= cfg.sampling.period_ms());
});
