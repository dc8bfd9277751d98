#![no_main]
use drip_config::{CalibrationRow, PersistedCalibration};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|points: Vec<(i64, f32)>| {
    let rows: Vec<CalibrationRow> = points
        .into_iter()
        .map(|(raw, grams)| CalibrationRow { raw, grams })
        .collect();
    if let Ok(cal) = PersistedCalibration::from_rows(&rows) {
        assert!(cal.scale_g_per_count.is_finite());
    }
});
