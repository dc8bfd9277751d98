//! Debounced hazard classification.
//!
//! Each detector owns its own debounce state. `SafetyEvaluator` runs all of
//! them every cycle and reports the single highest-priority event:
//!
//! ```text
//! AirDetect > FreeFlow > FlowStall > LowFluid > None
//! ```
//!
//! Evaluation never touches hardware or device state; acting on the result
//! is the monitoring loop's job.
use std::fmt;

use crate::config::SafetyCfg;
use crate::flow::FlowData;
use crate::util::ms_between;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SafetyEvent {
    #[default]
    None,
    LowFluid,
    FreeFlow,
    FlowStall,
    AirDetect,
}

impl SafetyEvent {
    /// Higher wins.
    pub const fn priority(self) -> u8 {
        match self {
            SafetyEvent::None => 0,
            SafetyEvent::LowFluid => 1,
            SafetyEvent::FlowStall => 2,
            SafetyEvent::FreeFlow => 3,
            SafetyEvent::AirDetect => 4,
        }
    }

    /// Events that must stop flow without delay.
    pub const fn is_hazard(self) -> bool {
        matches!(self, SafetyEvent::FreeFlow | SafetyEvent::AirDetect)
    }

    pub const fn name(self) -> &'static str {
        match self {
            SafetyEvent::None => "none",
            SafetyEvent::LowFluid => "low_fluid",
            SafetyEvent::FreeFlow => "free_flow",
            SafetyEvent::FlowStall => "flow_stall",
            SafetyEvent::AirDetect => "air_detect",
        }
    }
}

impl fmt::Display for SafetyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything one evaluation looks at.
#[derive(Debug, Clone, Copy)]
pub struct SafetyInputs {
    pub weight_g: f32,
    pub timestamp_ms: u32,
    /// `None` until the flow window is ready.
    pub flow: Option<FlowData>,
    pub expected_rate_ml_min: f32,
    pub air_detected: bool,
}

/// Fires after `required` consecutive samples below the threshold.
#[derive(Debug, Clone)]
pub struct LowFluidDetector {
    threshold_g: f32,
    required: u8,
    count: u8,
}

impl LowFluidDetector {
    pub fn new(threshold_g: f32, required: u8) -> Self {
        Self {
            threshold_g,
            required: required.max(1),
            count: 0,
        }
    }

    pub fn update(&mut self, weight_g: f32) -> bool {
        // NaN compares false and therefore counts as low.
        if weight_g >= self.threshold_g {
            self.count = 0;
        } else {
            self.count = self.count.saturating_add(1);
        }
        self.count >= self.required
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Length of the rolling rate history.
pub const RATE_HISTORY_LEN: usize = drip_config::FREE_FLOW_HISTORY_LEN;

/// Fires when the last `required` rates in the history all exceed
/// `expected × multiplier`.
#[derive(Debug, Clone)]
pub struct FreeFlowDetector {
    multiplier: f32,
    required: u8,
    /// Newest at `(head + LEN - 1) % LEN`; NaN marks a cycle without a measurement.
    history: [f32; RATE_HISTORY_LEN],
    head: usize,
    len: usize,
}

impl FreeFlowDetector {
    pub fn new(multiplier: f32, required: u8) -> Self {
        Self {
            multiplier,
            required: required.clamp(1, RATE_HISTORY_LEN as u8),
            history: [f32::NAN; RATE_HISTORY_LEN],
            head: 0,
            len: 0,
        }
    }

    pub fn update(&mut self, rate_ml_min: Option<f32>, expected_ml_min: f32) -> bool {
        self.history[self.head] = rate_ml_min.unwrap_or(f32::NAN);
        self.head = (self.head + 1) % RATE_HISTORY_LEN;
        self.len = (self.len + 1).min(RATE_HISTORY_LEN);
        self.consecutive(expected_ml_min) >= usize::from(self.required)
    }

    /// Newest-first run of qualifying rates.
    pub fn consecutive(&self, expected_ml_min: f32) -> usize {
        let limit = expected_ml_min * self.multiplier;
        (1..=self.len)
            .map(|back| self.history[(self.head + RATE_HISTORY_LEN - back) % RATE_HISTORY_LEN])
            .take_while(|r| *r > limit)
            .count()
    }

    /// Mean of the finite rates currently held.
    pub fn mean_rate(&self) -> Option<f32> {
        let (sum, n) = (1..=self.len)
            .map(|back| self.history[(self.head + RATE_HISTORY_LEN - back) % RATE_HISTORY_LEN])
            .filter(|r| r.is_finite())
            .fold((0.0f32, 0u32), |(s, n), r| (s + r, n + 1));
        (n > 0).then(|| sum / n as f32)
    }

    pub fn reset(&mut self) {
        self.history = [f32::NAN; RATE_HISTORY_LEN];
        self.head = 0;
        self.len = 0;
    }
}

/// Fires when the weight has not dropped by `epsilon_g` for `timeout_ms`.
///
/// Progress is measured from the last point at which the weight had fallen
/// by at least `epsilon_g`, so a slow but steady drain is not a stall. A rise
/// (bag topped up or swapped) lifts the reference weight without restarting
/// the timer.
#[derive(Debug, Clone)]
pub struct FlowStallDetector {
    epsilon_g: f32,
    timeout_ms: u64,
    /// (weight, timestamp) at the last progress point.
    anchor: Option<(f32, u32)>,
}

impl FlowStallDetector {
    pub fn new(epsilon_g: f32, timeout_ms: u64) -> Self {
        Self {
            epsilon_g,
            timeout_ms,
            anchor: None,
        }
    }

    pub fn update(&mut self, weight_g: f32, timestamp_ms: u32) -> bool {
        let Some((anchor_w, anchor_ts)) = self.anchor else {
            self.anchor = Some((weight_g, timestamp_ms));
            return false;
        };
        if anchor_w - weight_g >= self.epsilon_g {
            self.anchor = Some((weight_g, timestamp_ms));
            return false;
        }
        if weight_g > anchor_w {
            // Topped-up bag: drain is measured from the new level.
            self.anchor = Some((weight_g, anchor_ts));
        }
        u64::from(ms_between(anchor_ts, timestamp_ms)) >= self.timeout_ms
    }

    /// Milliseconds since the last progress point.
    pub fn stalled_for(&self, now_ms: u32) -> u64 {
        self.anchor
            .map_or(0, |(_, ts)| u64::from(ms_between(ts, now_ms)))
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }
}

/// Classifies an externally supplied air-in-line signal.
#[derive(Debug, Clone, Default)]
pub struct AirDetector {
    active: bool,
}

impl AirDetector {
    pub fn update(&mut self, signal: bool) -> bool {
        self.active = signal;
        signal
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn reset(&mut self) {
        self.active = false;
    }
}

#[derive(Debug, Clone)]
pub struct SafetyEvaluator {
    low: LowFluidDetector,
    free: FreeFlowDetector,
    stall: FlowStallDetector,
    air: AirDetector,
    default_expected_ml_min: f32,
    last: SafetyEvent,
}

impl SafetyEvaluator {
    pub fn new(cfg: &SafetyCfg) -> Self {
        Self {
            low: LowFluidDetector::new(cfg.low_fluid_threshold_g, cfg.low_fluid_debounce),
            free: FreeFlowDetector::new(cfg.free_flow_multiplier, cfg.free_flow_debounce),
            stall: FlowStallDetector::new(cfg.stall_epsilon_g, cfg.stall_timeout_ms),
            air: AirDetector::default(),
            default_expected_ml_min: cfg.default_expected_rate_ml_min,
            last: SafetyEvent::None,
        }
    }

    /// Apply new thresholds while keeping the running debounce state.
    pub fn reconfigure(&mut self, cfg: &SafetyCfg) {
        self.low.threshold_g = cfg.low_fluid_threshold_g;
        self.low.required = cfg.low_fluid_debounce.max(1);
        self.free.multiplier = cfg.free_flow_multiplier;
        self.free.required = cfg.free_flow_debounce.clamp(1, RATE_HISTORY_LEN as u8);
        self.stall.epsilon_g = cfg.stall_epsilon_g;
        self.stall.timeout_ms = cfg.stall_timeout_ms;
        self.default_expected_ml_min = cfg.default_expected_rate_ml_min;
    }

    fn expected_rate(&self, supplied: f32) -> f32 {
        if supplied.is_finite() && supplied > 0.0 {
            supplied
        } else {
            self.default_expected_ml_min
        }
    }

    /// Run every detector once and return the winning event.
    pub fn evaluate_safety(&mut self, inputs: &SafetyInputs) -> SafetyEvent {
        let expected = self.expected_rate(inputs.expected_rate_ml_min);
        let air = self.air.update(inputs.air_detected);
        let free = self
            .free
            .update(inputs.flow.map(|f| f.rate_ml_min), expected);
        let stall = self.stall.update(inputs.weight_g, inputs.timestamp_ms);
        let low = self.low.update(inputs.weight_g);

        let event = if air {
            SafetyEvent::AirDetect
        } else if free {
            SafetyEvent::FreeFlow
        } else if stall {
            SafetyEvent::FlowStall
        } else if low {
            SafetyEvent::LowFluid
        } else {
            SafetyEvent::None
        };
        self.last = event;
        event
    }

    pub fn last_event(&self) -> SafetyEvent {
        self.last
    }

    pub fn low_fluid(&self) -> &LowFluidDetector {
        &self.low
    }

    pub fn free_flow(&self) -> &FreeFlowDetector {
        &self.free
    }

    pub fn flow_stall(&self) -> &FlowStallDetector {
        &self.stall
    }

    pub fn reset(&mut self) {
        self.low.reset();
        self.free.reset();
        self.stall.reset();
        self.air.reset();
        self.last = SafetyEvent::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn inputs(weight_g: f32, ts: u32, rate: Option<f32>) -> SafetyInputs {
        SafetyInputs {
            weight_g,
            timestamp_ms: ts,
            flow: rate.map(|r| FlowData {
                rate_ml_min: r,
                time_to_empty_min: f32::INFINITY,
            }),
            expected_rate_ml_min: 100.0,
            air_detected: false,
        }
    }

    #[test]
    fn low_fluid_fires_exactly_on_third_sample() {
        let mut d = LowFluidDetector::new(10.0, 3);
        assert!(!d.update(9.0));
        assert!(!d.update(9.0));
        assert!(d.update(9.0));
        assert!(d.update(8.0));
    }

    #[test]
    fn one_good_sample_resets_low_fluid() {
        let mut d = LowFluidDetector::new(10.0, 3);
        d.update(9.0);
        d.update(9.0);
        assert!(!d.update(10.0));
        assert_eq!(d.count(), 0);
        assert!(!d.update(9.0));
        assert!(!d.update(9.0));
        assert!(d.update(9.0));
    }

    #[test]
    fn free_flow_needs_five_in_a_row() {
        let mut d = FreeFlowDetector::new(1.5, 5);
        for _ in 0..4 {
            assert!(!d.update(Some(200.0), 100.0));
        }
        assert!(d.update(Some(200.0), 100.0));
        assert!((d.mean_rate().unwrap() - 200.0).abs() < 1e-4);
    }

    #[rstest]
    #[case(Some(150.0))] // at the limit, not above it
    #[case(Some(90.0))]
    #[case(None)]
    fn non_qualifying_rate_breaks_the_run(#[case] breaker: Option<f32>) {
        let mut d = FreeFlowDetector::new(1.5, 5);
        for _ in 0..4 {
            d.update(Some(200.0), 100.0);
        }
        assert!(!d.update(breaker, 100.0));
        assert_eq!(d.consecutive(100.0), 0);
        for _ in 0..4 {
            assert!(!d.update(Some(200.0), 100.0));
        }
        assert!(d.update(Some(200.0), 100.0));
    }

    #[test]
    fn stall_measured_from_last_progress_point() {
        let mut d = FlowStallDetector::new(0.5, 30_000);
        assert!(!d.update(300.0, 0));
        // 0.1 g per second is slow, but it crosses epsilon every 5 s.
        for s in 1..=60u32 {
            let w = 300.0 - 0.1 * s as f32;
            assert!(!d.update(w, s * 1000), "false stall at {s}s");
        }
        // Now it stops.
        let w = 300.0 - 6.0;
        assert!(!d.update(w, 89_000));
        assert!(d.update(w, 90_000 + 30_000));
        assert!(d.stalled_for(120_000) >= 30_000);
    }

    #[test]
    fn top_up_moves_the_stall_reference() {
        let mut d = FlowStallDetector::new(0.5, 30_000);
        // 0.2 g per 100 ms from 300 g, about 120 mL/min.
        let mut t = 0u32;
        let mut w = 300.0f32;
        for _ in 0..100 {
            assert!(!d.update(w, t));
            w -= 0.2;
            t += 100;
        }
        // New bag, same drain.
        w = 700.0;
        for _ in 0..600 {
            assert!(!d.update(w, t), "false stall {}ms after top-up at {w} g", t - 10_000);
            w -= 0.2;
            t += 100;
        }
    }

    #[test]
    fn top_up_does_not_hide_a_real_stall() {
        let mut d = FlowStallDetector::new(0.5, 30_000);
        assert!(!d.update(300.0, 0));
        assert!(!d.update(700.0, 1_000));
        assert!(!d.update(700.0, 29_000));
        assert!(d.update(700.0, 30_000));
    }

    #[test]
    fn precedence_free_flow_beats_low_fluid() {
        let mut ev = SafetyEvaluator::new(&SafetyCfg::default());
        let mut last = SafetyEvent::None;
        for i in 0..5u32 {
            last = ev.evaluate_safety(&inputs(5.0, i * 100, Some(400.0)));
        }
        assert_eq!(last, SafetyEvent::FreeFlow);
        assert_eq!(ev.low_fluid().count(), 5);
    }

    #[test]
    fn air_beats_everything() {
        let mut ev = SafetyEvaluator::new(&SafetyCfg::default());
        let mut inp = inputs(5.0, 0, Some(400.0));
        for i in 0..5u32 {
            inp.timestamp_ms = i * 100;
            ev.evaluate_safety(&inp);
        }
        inp.air_detected = true;
        inp.timestamp_ms = 600;
        assert_eq!(ev.evaluate_safety(&inp), SafetyEvent::AirDetect);
    }

    #[test]
    fn stall_beats_low_fluid() {
        let cfg = SafetyCfg {
            stall_timeout_ms: 1_000,
            ..SafetyCfg::default()
        };
        let mut ev = SafetyEvaluator::new(&cfg);
        let mut last = SafetyEvent::None;
        for i in 0..=10u32 {
            last = ev.evaluate_safety(&inputs(5.0, i * 100, Some(0.0)));
        }
        assert_eq!(last, SafetyEvent::FlowStall);
    }

    #[rstest]
    #[case(0.0)]
    #[case(-10.0)]
    #[case(f32::NAN)]
    fn bad_expected_rate_falls_back_to_default(#[case] expected: f32) {
        let mut ev = SafetyEvaluator::new(&SafetyCfg::default());
        let mut inp = inputs(400.0, 0, Some(400.0));
        inp.expected_rate_ml_min = expected;
        let mut last = SafetyEvent::None;
        for i in 0..5u32 {
            inp.timestamp_ms = i * 100;
            inp.weight_g -= 1.0;
            last = ev.evaluate_safety(&inp);
        }
        // Default 100 mL/min × 1.5 = 150 < 400
        assert_eq!(last, SafetyEvent::FreeFlow);
    }

    #[test]
    fn reset_clears_all_debounce_state() {
        let mut ev = SafetyEvaluator::new(&SafetyCfg::default());
        ev.evaluate_safety(&inputs(5.0, 0, Some(400.0)));
        ev.evaluate_safety(&inputs(5.0, 100, Some(400.0)));
        ev.reset();
        assert_eq!(ev.low_fluid().count(), 0);
        assert_eq!(ev.free_flow().consecutive(100.0), 0);
        assert_eq!(ev.flow_stall().stalled_for(10_000), 0);
        assert_eq!(ev.last_event(), SafetyEvent::None);
    }

    #[test]
    fn free_flow_debounce_spans_the_whole_history() {
        let mut d = FreeFlowDetector::new(1.5, RATE_HISTORY_LEN as u8);
        for _ in 1..RATE_HISTORY_LEN {
            assert!(!d.update(Some(400.0), 100.0));
        }
        assert!(d.update(Some(400.0), 100.0));
    }

    #[test]
    fn reconfigure_keeps_counters() {
        let mut ev = SafetyEvaluator::new(&SafetyCfg::default());
        ev.evaluate_safety(&inputs(15.0, 0, None));
        ev.evaluate_safety(&inputs(15.0, 100, None));
        ev.reconfigure(&SafetyCfg {
            low_fluid_threshold_g: 20.0,
            ..SafetyCfg::default()
        });
        assert_eq!(ev.low_fluid().count(), 0);
        ev.evaluate_safety(&inputs(15.0, 200, None));
        ev.evaluate_safety(&inputs(15.0, 300, None));
        assert_eq!(
            ev.evaluate_safety(&inputs(15.0, 400, None)),
            SafetyEvent::LowFluid
        );
    }
}
