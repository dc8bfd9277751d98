//! Flow rate and time-to-empty from a fixed window of filtered weights.
use tracing::trace;

use crate::util::{MILLIS_PER_MIN, ms_between};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FlowSample {
    pub weight_g: f32,
    pub timestamp_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowData {
    pub rate_ml_min: f32,
    /// `f32::INFINITY` when the bag is not draining.
    pub time_to_empty_min: f32,
}

/// Circular buffer of weight samples. Capacity never changes after `new`.
#[derive(Debug, Clone)]
pub struct FlowCalculator {
    buf: Box<[FlowSample]>,
    /// Next write position; once full it is also the oldest sample.
    head: usize,
    len: usize,
    density_g_per_ml: f32,
    latest: Option<FlowData>,
}

impl FlowCalculator {
    /// `capacity` is raised to 2; a non-positive density falls back to water.
    pub fn new(capacity: usize, density_g_per_ml: f32) -> Self {
        let density_g_per_ml = if density_g_per_ml.is_finite() && density_g_per_ml > 0.0 {
            density_g_per_ml
        } else {
            drip_config::WATER_DENSITY_G_PER_ML
        };
        Self {
            buf: vec![FlowSample::default(); capacity.max(2)].into_boxed_slice(),
            head: 0,
            len: 0,
            density_g_per_ml,
            latest: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn density(&self) -> f32 {
        self.density_g_per_ml
    }

    /// True once the window has filled at least once.
    pub fn is_ready(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Most recent measurement, if any.
    pub fn latest(&self) -> Option<FlowData> {
        self.latest
    }

    /// Insert a sample and recompute. `None` until the window is full, or
    /// when the window spans no time at all.
    pub fn update(&mut self, weight_g: f32, timestamp_ms: u32) -> Option<FlowData> {
        let cap = self.buf.len();
        self.buf[self.head] = FlowSample {
            weight_g,
            timestamp_ms,
        };
        self.head = (self.head + 1) % cap;
        self.len = (self.len + 1).min(cap);
        if !self.is_ready() {
            return None;
        }

        let oldest = self.buf[self.head];
        let newest = self.buf[(self.head + cap - 1) % cap];
        let span_ms = ms_between(oldest.timestamp_ms, newest.timestamp_ms);
        if span_ms == 0 {
            self.latest = None;
            return None;
        }

        let delta_ml = (oldest.weight_g - newest.weight_g) / self.density_g_per_ml;
        let rate_ml_min = delta_ml / (span_ms as f32 / MILLIS_PER_MIN);
        let remaining_ml = newest.weight_g.max(0.0) / self.density_g_per_ml;
        let time_to_empty_min = if rate_ml_min > 0.0 {
            remaining_ml / rate_ml_min
        } else {
            f32::INFINITY
        };
        trace!(rate_ml_min, time_to_empty_min, span_ms, "flow update");
        let data = FlowData {
            rate_ml_min,
            time_to_empty_min,
        };
        self.latest = Some(data);
        Some(data)
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
        self.latest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn feed(calc: &mut FlowCalculator, weights: &[f32], step_ms: u32) -> Option<FlowData> {
        let mut out = None;
        for (i, w) in weights.iter().enumerate() {
            out = calc.update(*w, i as u32 * step_ms);
        }
        out
    }

    #[test]
    fn not_ready_until_window_fills() {
        let mut calc = FlowCalculator::new(3, 1.0);
        assert!(calc.update(100.0, 0).is_none());
        assert!(calc.update(99.0, 100).is_none());
        assert!(!calc.is_ready());
        assert!(calc.update(98.0, 200).is_some());
        assert!(calc.is_ready());
    }

    #[rstest]
    #[case(0.2, 100, 120.0)]
    #[case(2.0, 1000, 120.0)]
    #[case(0.5, 100, 300.0)]
    fn linear_drain_matches_analytic_rate(
        #[case] k_g: f32,
        #[case] step_ms: u32,
        #[case] expected_ml_min: f32,
    ) {
        let mut calc = FlowCalculator::new(10, 1.0);
        let weights: Vec<f32> = (0..25).map(|i| 500.0 - k_g * i as f32).collect();
        let flow = feed(&mut calc, &weights, step_ms).unwrap();
        assert!(
            (flow.rate_ml_min - expected_ml_min).abs() < 0.05,
            "rate = {}",
            flow.rate_ml_min
        );
        let remaining = weights[24];
        assert!((flow.time_to_empty_min - remaining / expected_ml_min).abs() < 0.01);
    }

    #[test]
    fn flat_weight_gives_zero_rate_and_infinite_eta() {
        let mut calc = FlowCalculator::new(5, 1.0);
        let flow = feed(&mut calc, &[250.0; 8], 100).unwrap();
        assert_eq!(flow.rate_ml_min, 0.0);
        assert!(flow.time_to_empty_min.is_infinite());
    }

    #[test]
    fn rising_weight_is_not_draining() {
        let mut calc = FlowCalculator::new(3, 1.0);
        let flow = feed(&mut calc, &[100.0, 101.0, 102.0], 100).unwrap();
        assert!(flow.rate_ml_min < 0.0);
        assert_eq!(flow.time_to_empty_min, f32::INFINITY);
    }

    #[test]
    fn density_scales_volume() {
        let mut calc = FlowCalculator::new(2, drip_config::SALINE_DENSITY_G_PER_ML);
        let flow = feed(&mut calc, &[100.0, 98.0], 1000).unwrap();
        let expected = 2.0 / drip_config::SALINE_DENSITY_G_PER_ML * 60.0;
        assert!((flow.rate_ml_min - expected).abs() < 1e-3);
    }

    #[test]
    fn zero_span_is_not_a_measurement() {
        let mut calc = FlowCalculator::new(2, 1.0);
        calc.update(100.0, 500);
        assert!(calc.update(99.0, 500).is_none());
        assert!(calc.latest().is_none());
    }

    #[test]
    fn capacity_is_fixed_and_reset_empties() {
        let mut calc = FlowCalculator::new(4, 1.0);
        feed(&mut calc, &[10.0; 100], 10);
        assert_eq!(calc.capacity(), 4);
        calc.reset();
        assert!(!calc.is_ready());
        assert!(calc.latest().is_none());
        assert_eq!(FlowCalculator::new(0, 0.0).capacity(), 2);
        assert_eq!(FlowCalculator::new(0, -1.0).density(), 1.0);
    }

    #[test]
    fn timestamp_rollover_is_measured_forward() {
        let mut calc = FlowCalculator::new(2, 1.0);
        calc.update(100.0, u32::MAX - 499);
        let flow = calc.update(99.0, 500).unwrap();
        // 1 g over 1000 ms
        assert!((flow.rate_ml_min - 60.0).abs() < 1e-3);
    }
}
