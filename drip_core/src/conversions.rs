//! `From` implementations bridging `drip_config` types to `drip_core` types.

use crate::config::{FilterCfg, FlowCfg, KalmanCfg, MonitorCfg, SafetyCfg, TimingCfg, WatchdogCfg};

// ── FilterCfg ────────────────────────────────────────────────────────────────

impl From<&drip_config::FilterCfg> for FilterCfg {
    fn from(c: &drip_config::FilterCfg) -> Self {
        Self {
            ema_alpha: c.ema_alpha,
            kalman: c.kalman_enabled.then_some(KalmanCfg {
                q: c.kalman_q,
                r: c.kalman_r,
            }),
        }
    }
}

// ── FlowCfg ──────────────────────────────────────────────────────────────────

impl From<&drip_config::FlowCfg> for FlowCfg {
    fn from(c: &drip_config::FlowCfg) -> Self {
        Self {
            window_samples: c.window_samples,
            density_g_per_ml: c.density(),
        }
    }
}

// ── SafetyCfg ────────────────────────────────────────────────────────────────

impl From<&drip_config::Config> for SafetyCfg {
    fn from(c: &drip_config::Config) -> Self {
        let s = &c.safety;
        Self {
            low_fluid_threshold_g: s.low_fluid_threshold_g,
            low_fluid_debounce: s.low_fluid_debounce,
            free_flow_multiplier: s.free_flow_multiplier,
            free_flow_debounce: s.free_flow_debounce,
            stall_epsilon_g: s.stall_epsilon_g,
            stall_timeout_ms: s.stall_timeout_ms,
            default_expected_rate_ml_min: c.flow.expected_rate_ml_min,
        }
    }
}

// ── TimingCfg ────────────────────────────────────────────────────────────────

impl From<&drip_config::Config> for TimingCfg {
    fn from(c: &drip_config::Config) -> Self {
        Self {
            period_ms: c.sampling.period_ms(),
            sensor_timeout_ms: c.sampling.sensor_timeout_ms,
            max_stale_cycles: c.sampling.max_stale_cycles,
            low_fluid_clamp_delay_ms: c.safety.low_fluid_clamp_delay_ms,
        }
    }
}

// ── MonitorCfg ───────────────────────────────────────────────────────────────

impl From<&drip_config::Config> for MonitorCfg {
    fn from(c: &drip_config::Config) -> Self {
        Self {
            filter: FilterCfg::from(&c.filter),
            flow: FlowCfg::from(&c.flow),
            safety: SafetyCfg::from(c),
            timing: TimingCfg::from(c),
        }
    }
}

// ── WatchdogCfg ──────────────────────────────────────────────────────────────

impl From<&drip_config::WatchdogCfg> for WatchdogCfg {
    fn from(c: &drip_config::WatchdogCfg) -> Self {
        Self {
            timeout_ms: c.timeout_ms,
            max_missed: c.max_missed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_line_up_with_file_defaults() {
        let file = drip_config::Config::default();
        let cfg = MonitorCfg::from(&file);
        assert_eq!(cfg, MonitorCfg::default());
        assert_eq!(WatchdogCfg::from(&file.watchdog), WatchdogCfg::default());
    }

    #[test]
    fn kalman_only_when_enabled() {
        let mut file = drip_config::Config::default();
        assert!(FilterCfg::from(&file.filter).kalman.is_none());
        file.filter.kalman_enabled = true;
        let k = FilterCfg::from(&file.filter).kalman.unwrap();
        assert!((k.r - 0.5).abs() < 1e-6);
    }
}
