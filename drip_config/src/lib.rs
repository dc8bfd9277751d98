#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema and calibration parsing for the drip monitor.
//!
//! - `Config` and sub-structs are deserialized from TOML. Every section is
//!   optional and falls back to the device defaults.
//! - `Config::sanitize` never rejects a file: out-of-range values are replaced
//!   by their defaults and reported as `ConfigWarning`s, so a typo can never
//!   switch a safety detector off.
//! - Calibration CSV loader enforces headers and fits `raw,grams` points.
use serde::Deserialize;
use std::fmt;

/// Density of water at 25 °C (g/mL).
pub const WATER_DENSITY_G_PER_ML: f32 = 1.0;
/// Density of 0.9 % NaCl (g/mL).
pub const SALINE_DENSITY_G_PER_ML: f32 = 1.0046;
/// Rates remembered by the free-flow detector; bounds `free_flow_debounce`.
pub const FREE_FLOW_HISTORY_LEN: usize = 10;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Pins {
    pub hx711_sck: u8,
    pub hx711_dout: u8,
    pub servo_pwm: u8,
    pub buzzer: u8,
    pub button: u8,
}

impl Default for Pins {
    fn default() -> Self {
        Self {
            hx711_sck: 18,
            hx711_dout: 19,
            servo_pwm: 13,
            buzzer: 15,
            button: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SamplingCfg {
    /// Monitoring loop rate; one weight sample per cycle.
    pub sample_rate_hz: u32,
    /// Bounded wait for a fresh reading inside one cycle (ms).
    pub sensor_timeout_ms: u64,
    /// Consecutive stale/invalid cycles tolerated before a sensor failure.
    pub max_stale_cycles: u32,
}

impl Default for SamplingCfg {
    fn default() -> Self {
        Self {
            sample_rate_hz: 10,
            sensor_timeout_ms: 50,
            max_stale_cycles: 10,
        }
    }
}

impl SamplingCfg {
    pub fn period_ms(&self) -> u64 {
        (1000 / u64::from(self.sample_rate_hz.max(1))).max(1)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FilterCfg {
    /// EMA smoothing factor in (0.0, 1.0].
    pub ema_alpha: f32,
    /// Cascade the 1-D recursive estimator after the EMA.
    pub kalman_enabled: bool,
    /// Process noise (>= 0).
    pub kalman_q: f32,
    /// Measurement noise (> 0).
    pub kalman_r: f32,
}

impl Default for FilterCfg {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            kalman_enabled: false,
            kalman_q: 0.01,
            kalman_r: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Fluid {
    Water,
    #[default]
    Saline,
}

impl Fluid {
    pub fn density_g_per_ml(self) -> f32 {
        match self {
            Fluid::Water => WATER_DENSITY_G_PER_ML,
            Fluid::Saline => SALINE_DENSITY_G_PER_ML,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FlowCfg {
    /// Sliding window length in samples (30 = 3 s at 10 Hz).
    pub window_samples: usize,
    /// Fluid preset used when `density_g_per_ml` is absent.
    pub fluid: Fluid,
    /// Explicit density override (g/mL).
    pub density_g_per_ml: Option<f32>,
    /// Prescribed rate used when the caller does not supply one.
    pub expected_rate_ml_min: f32,
}

impl Default for FlowCfg {
    fn default() -> Self {
        Self {
            window_samples: 30,
            fluid: Fluid::Saline,
            density_g_per_ml: None,
            expected_rate_ml_min: 100.0,
        }
    }
}

impl FlowCfg {
    pub fn density(&self) -> f32 {
        self.density_g_per_ml
            .unwrap_or_else(|| self.fluid.density_g_per_ml())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SafetyCfg {
    pub low_fluid_threshold_g: f32,
    pub low_fluid_debounce: u8,
    pub free_flow_multiplier: f32,
    pub free_flow_debounce: u8,
    /// Weight must drop by at least this much within `stall_timeout_ms`.
    pub stall_epsilon_g: f32,
    pub stall_timeout_ms: u64,
    /// How long a low-fluid alarm may stand before the line is clamped (0 = at once).
    pub low_fluid_clamp_delay_ms: u64,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            low_fluid_threshold_g: 10.0,
            low_fluid_debounce: 3,
            free_flow_multiplier: 1.5,
            free_flow_debounce: 5,
            stall_epsilon_g: 0.5,
            stall_timeout_ms: 30_000,
            low_fluid_clamp_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClampCfg {
    pub clamp_angle: u8,
    pub open_angle: u8,
    /// Per-degree delay for a graduated clamp; 0 jumps straight to the angle.
    pub smooth_step_delay_ms: u64,
}

impl Default for ClampCfg {
    fn default() -> Self {
        Self {
            clamp_angle: 90,
            open_angle: 0,
            smooth_step_delay_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatchdogCfg {
    /// A monitoring cycle must complete within this deadline.
    pub timeout_ms: u64,
    /// Consecutive missed deadlines before the restart hook fires.
    pub max_missed: u32,
}

impl Default for WatchdogCfg {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_missed: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayCfg {
    pub refresh_ms: u64,
    pub screensaver_timeout_ms: u64,
}

impl Default for DisplayCfg {
    fn default() -> Self {
        Self {
            refresh_ms: 500,
            screensaver_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryCfg {
    pub publish_interval_ms: u64,
    pub device_id: String,
}

impl Default for TelemetryCfg {
    fn default() -> Self {
        Self {
            publish_interval_ms: 5_000,
            device_id: "dripsense-sim".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// Tare offset and scale as persisted after a calibration run.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct PersistedCalibration {
    /// Raw counts at zero load.
    pub offset_counts: i32,
    /// Grams per raw count.
    pub scale_g_per_count: f32,
}

impl PersistedCalibration {
    pub fn to_grams(&self, raw: i32) -> f32 {
        (raw.saturating_sub(self.offset_counts)) as f32 * self.scale_g_per_count
    }

    /// TOML snippet suitable for pasting into the config file.
    pub fn to_toml_snippet(&self) -> String {
        format!(
            "[calibration]\noffset_counts = {}\nscale_g_per_count = {}\n",
            self.offset_counts, self.scale_g_per_count
        )
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub pins: Pins,
    pub sampling: SamplingCfg,
    pub filter: FilterCfg,
    pub flow: FlowCfg,
    pub safety: SafetyCfg,
    pub clamp: ClampCfg,
    pub watchdog: WatchdogCfg,
    pub display: DisplayCfg,
    pub telemetry: TelemetryCfg,
    pub logging: Logging,
    pub calibration: Option<PersistedCalibration>,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// A value that was out of range and has been replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub found: String,
    pub replaced_with: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {} is out of range; using {}",
            self.field, self.found, self.replaced_with
        )
    }
}

struct Sanitizer {
    warnings: Vec<ConfigWarning>,
}

impl Sanitizer {
    fn fix<T>(&mut self, field: &'static str, value: &mut T, ok: bool, default: T)
    where
        T: fmt::Debug,
    {
        if ok {
            return;
        }
        self.warnings.push(ConfigWarning {
            field,
            found: format!("{value:?}"),
            replaced_with: format!("{default:?}"),
        });
        *value = default;
    }
}

impl Config {
    /// Clamp every out-of-range value to its default.
    ///
    /// Returns one warning per replaced value; an empty vector means the
    /// file was used as written.
    pub fn sanitize(&mut self) -> Vec<ConfigWarning> {
        let mut s = Sanitizer {
            warnings: Vec::new(),
        };
        let d = Config::default();

        // Sampling
        let hz = self.sampling.sample_rate_hz;
        s.fix(
            "sampling.sample_rate_hz",
            &mut self.sampling.sample_rate_hz,
            (1..=1000).contains(&hz),
            d.sampling.sample_rate_hz,
        );
        let period_ms = self.sampling.period_ms();
        let timeout = self.sampling.sensor_timeout_ms;
        s.fix(
            "sampling.sensor_timeout_ms",
            &mut self.sampling.sensor_timeout_ms,
            // A 1 ms period still needs a 1 ms timeout.
            timeout > 0 && timeout < period_ms.max(2),
            (period_ms / 2).max(1),
        );
        let stale = self.sampling.max_stale_cycles;
        s.fix(
            "sampling.max_stale_cycles",
            &mut self.sampling.max_stale_cycles,
            stale > 0,
            d.sampling.max_stale_cycles,
        );

        // Filter
        let a = self.filter.ema_alpha;
        s.fix(
            "filter.ema_alpha",
            &mut self.filter.ema_alpha,
            a.is_finite() && a > 0.0 && a <= 1.0,
            d.filter.ema_alpha,
        );
        let q = self.filter.kalman_q;
        s.fix(
            "filter.kalman_q",
            &mut self.filter.kalman_q,
            q.is_finite() && q >= 0.0,
            d.filter.kalman_q,
        );
        let r = self.filter.kalman_r;
        s.fix(
            "filter.kalman_r",
            &mut self.filter.kalman_r,
            r.is_finite() && r > 0.0,
            d.filter.kalman_r,
        );

        // Flow
        let w = self.flow.window_samples;
        s.fix(
            "flow.window_samples",
            &mut self.flow.window_samples,
            (2..=6000).contains(&w),
            d.flow.window_samples,
        );
        if let Some(rho) = self.flow.density_g_per_ml {
            s.fix(
                "flow.density_g_per_ml",
                &mut self.flow.density_g_per_ml,
                rho.is_finite() && rho > 0.0,
                None,
            );
        }
        let rate = self.flow.expected_rate_ml_min;
        s.fix(
            "flow.expected_rate_ml_min",
            &mut self.flow.expected_rate_ml_min,
            rate.is_finite() && rate > 0.0,
            d.flow.expected_rate_ml_min,
        );

        // Safety
        let thr = self.safety.low_fluid_threshold_g;
        s.fix(
            "safety.low_fluid_threshold_g",
            &mut self.safety.low_fluid_threshold_g,
            thr.is_finite() && thr > 0.0,
            d.safety.low_fluid_threshold_g,
        );
        let n = self.safety.low_fluid_debounce;
        s.fix(
            "safety.low_fluid_debounce",
            &mut self.safety.low_fluid_debounce,
            n > 0,
            d.safety.low_fluid_debounce,
        );
        let m = self.safety.free_flow_multiplier;
        s.fix(
            "safety.free_flow_multiplier",
            &mut self.safety.free_flow_multiplier,
            m.is_finite() && m >= 1.0,
            d.safety.free_flow_multiplier,
        );
        let n = self.safety.free_flow_debounce;
        s.fix(
            "safety.free_flow_debounce",
            &mut self.safety.free_flow_debounce,
            n > 0 && usize::from(n) <= FREE_FLOW_HISTORY_LEN,
            d.safety.free_flow_debounce,
        );
        let eps = self.safety.stall_epsilon_g;
        s.fix(
            "safety.stall_epsilon_g",
            &mut self.safety.stall_epsilon_g,
            eps.is_finite() && eps > 0.0,
            d.safety.stall_epsilon_g,
        );
        let t = self.safety.stall_timeout_ms;
        s.fix(
            "safety.stall_timeout_ms",
            &mut self.safety.stall_timeout_ms,
            t > 0,
            d.safety.stall_timeout_ms,
        );

        // Clamp: a clamp position equal to the open position would never stop flow.
        let (c, o) = (self.clamp.clamp_angle, self.clamp.open_angle);
        let angles_ok = c <= 180 && o <= 180 && c != o;
        s.fix(
            "clamp.clamp_angle",
            &mut self.clamp.clamp_angle,
            angles_ok,
            d.clamp.clamp_angle,
        );
        s.fix(
            "clamp.open_angle",
            &mut self.clamp.open_angle,
            angles_ok,
            d.clamp.open_angle,
        );

        // Watchdog must allow at least two cycles.
        let wd = self.watchdog.timeout_ms;
        s.fix(
            "watchdog.timeout_ms",
            &mut self.watchdog.timeout_ms,
            wd >= period_ms.saturating_mul(2),
            d.watchdog.timeout_ms.max(period_ms.saturating_mul(2)),
        );
        let mm = self.watchdog.max_missed;
        s.fix(
            "watchdog.max_missed",
            &mut self.watchdog.max_missed,
            mm > 0,
            d.watchdog.max_missed,
        );

        // Consumers
        let rf = self.display.refresh_ms;
        s.fix(
            "display.refresh_ms",
            &mut self.display.refresh_ms,
            rf > 0,
            d.display.refresh_ms,
        );
        let tp = self.telemetry.publish_interval_ms;
        s.fix(
            "telemetry.publish_interval_ms",
            &mut self.telemetry.publish_interval_ms,
            tp > 0,
            d.telemetry.publish_interval_ms,
        );

        if let Some(cal) = self.calibration {
            let ok = cal.scale_g_per_count.is_finite() && cal.scale_g_per_count != 0.0;
            s.fix("calibration", &mut self.calibration, ok, None);
        }

        s.warnings
    }
}

/// Calibration CSV schema.
///
/// Expected headers:
/// raw,grams
///
/// Example:
/// raw,grams
/// 842913,0.0
/// 1024913,500.0
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CalibrationRow {
    pub raw: i64,
    pub grams: f32,
}

impl PersistedCalibration {
    /// Least-squares fit of `grams = scale * (raw - offset)` over all rows.
    pub fn from_rows(rows: &[CalibrationRow]) -> eyre::Result<Self> {
        if rows.len() < 2 {
            eyre::bail!("calibration requires at least two rows, got {}", rows.len());
        }
        let n = rows.len() as f64;
        let mean_x = rows.iter().map(|r| r.raw as f64).sum::<f64>() / n;
        let mean_y = rows.iter().map(|r| f64::from(r.grams)).sum::<f64>() / n;
        let (sxx, sxy) = rows.iter().fold((0.0f64, 0.0f64), |(sxx, sxy), r| {
            let dx = r.raw as f64 - mean_x;
            (sxx + dx * dx, sxy + dx * (f64::from(r.grams) - mean_y))
        });
        if !sxx.is_finite() || sxx == 0.0 {
            eyre::bail!("calibration cannot determine slope (all raw values equal)");
        }
        let slope = sxy / sxx;
        if !slope.is_finite() || slope == 0.0 {
            eyre::bail!("calibration produced an unusable slope");
        }
        let intercept = mean_y - slope * mean_x;
        let offset = -intercept / slope;
        if !offset.is_finite() || offset.abs() > f64::from(i32::MAX) {
            eyre::bail!("calibration produced invalid tare offset");
        }
        Ok(Self {
            offset_counts: offset.round() as i32,
            scale_g_per_count: slope as f32,
        })
    }
}

pub fn load_calibration_csv(path: &std::path::Path) -> eyre::Result<PersistedCalibration> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration CSV {:?}: {}", path, e))?;

    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let actual: Vec<&str> = headers.iter().collect();
    if actual != ["raw", "grams"] {
        eyre::bail!(
            "calibration CSV must have headers 'raw,grams', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<CalibrationRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => eyre::bail!("invalid CSV row {}: {}", idx + 2, e),
        }
    }

    PersistedCalibration::from_rows(&rows)
}
