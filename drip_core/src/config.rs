//! Runtime configuration for the monitoring pipeline.
//!
//! These are the already-sanitized values the loop runs with. They are
//! separate from the TOML-deserialized config in `drip_config`; see
//! `conversions` for the mapping.

/// Signal conditioning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterCfg {
    /// EMA smoothing factor in (0.0, 1.0].
    pub ema_alpha: f32,
    /// When set, a 1-D recursive estimator runs after the EMA.
    pub kalman: Option<KalmanCfg>,
}

impl Default for FilterCfg {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            kalman: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanCfg {
    /// Process noise.
    pub q: f32,
    /// Measurement noise.
    pub r: f32,
}

impl Default for KalmanCfg {
    fn default() -> Self {
        Self { q: 0.01, r: 0.5 }
    }
}

/// Flow window and fluid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowCfg {
    /// Window length in samples.
    pub window_samples: usize,
    pub density_g_per_ml: f32,
}

impl Default for FlowCfg {
    fn default() -> Self {
        Self {
            window_samples: 30,
            density_g_per_ml: drip_config::SALINE_DENSITY_G_PER_ML,
        }
    }
}

/// Detector thresholds and debounce counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyCfg {
    pub low_fluid_threshold_g: f32,
    pub low_fluid_debounce: u8,
    pub free_flow_multiplier: f32,
    pub free_flow_debounce: u8,
    pub stall_epsilon_g: f32,
    pub stall_timeout_ms: u64,
    /// Used whenever the supplied expected rate is unusable.
    pub default_expected_rate_ml_min: f32,
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
            default_expected_rate_ml_min: 100.0,
        }
    }
}

/// Loop cadence and escalation timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingCfg {
    pub period_ms: u64,
    /// Bounded wait for a reading inside one cycle.
    pub sensor_timeout_ms: u64,
    /// Stale cycles tolerated before a forced sensor failure.
    pub max_stale_cycles: u32,
    /// 0 clamps on the first low-fluid cycle.
    pub low_fluid_clamp_delay_ms: u64,
}

impl Default for TimingCfg {
    fn default() -> Self {
        Self {
            period_ms: 100,
            sensor_timeout_ms: 50,
            max_stale_cycles: 10,
            low_fluid_clamp_delay_ms: 30_000,
        }
    }
}

/// Everything the monitoring loop needs; also the unit of a live reload.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MonitorCfg {
    pub filter: FilterCfg,
    pub flow: FlowCfg,
    pub safety: SafetyCfg,
    pub timing: TimingCfg,
}

/// Loop-liveness supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogCfg {
    pub timeout_ms: u64,
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
