//! Weight smoothing: an exponential filter, optionally followed by a 1-D
//! recursive estimator.
//!
//! Both stages are a handful of floats owned by the caller; no allocation,
//! one step of latency.
use crate::config::{FilterCfg, KalmanCfg};
use crate::types::WeightReading;

/// Exponential moving average. The first sample seeds the state.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f32,
    prev: Option<f32>,
}

impl Ema {
    /// `alpha` outside (0, 1] is treated as 1.0 (no smoothing).
    pub fn new(alpha: f32) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 {
            alpha.min(1.0)
        } else {
            1.0
        };
        Self { alpha, prev: None }
    }

    pub fn update(&mut self, x: f32) -> f32 {
        let y = match self.prev {
            None => x,
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
        };
        self.prev = Some(y);
        y
    }

    pub fn value(&self) -> Option<f32> {
        self.prev
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}

/// Initial error covariance.
pub const KALMAN_INITIAL_P: f32 = 1.0;

/// Scalar Kalman filter for a constant-plus-noise signal.
#[derive(Debug, Clone, Copy)]
pub struct Kalman1d {
    q: f32,
    r: f32,
    x: Option<f32>,
    p: f32,
    k: f32,
}

impl Kalman1d {
    pub fn new(q: f32, r: f32) -> Self {
        Self {
            q: if q.is_finite() { q.max(0.0) } else { 0.0 },
            r: if r.is_finite() && r > 0.0 { r } else { 1.0 },
            x: None,
            p: KALMAN_INITIAL_P,
            k: 0.0,
        }
    }

    /// Start from a known estimate instead of seeding from the first measurement.
    pub fn with_estimate(q: f32, r: f32, x0: f32) -> Self {
        let mut k = Self::new(q, r);
        k.x = Some(x0);
        k
    }

    pub fn update(&mut self, z: f32) -> f32 {
        let x = *self.x.get_or_insert(z);
        self.p += self.q;
        self.k = self.p / (self.p + self.r);
        let x = x + self.k * (z - x);
        self.p *= 1.0 - self.k;
        self.x = Some(x);
        x
    }

    pub fn estimate(&self) -> Option<f32> {
        self.x
    }

    /// Gain used by the most recent update.
    pub fn gain(&self) -> f32 {
        self.k
    }

    pub fn covariance(&self) -> f32 {
        self.p
    }

    pub fn reset(&mut self) {
        self.x = None;
        self.p = KALMAN_INITIAL_P;
        self.k = 0.0;
    }
}

impl From<KalmanCfg> for Kalman1d {
    fn from(c: KalmanCfg) -> Self {
        Self::new(c.q, c.r)
    }
}

/// EMA followed by the optional estimator, fed one reading per cycle.
#[derive(Debug, Clone)]
pub struct SignalPipeline {
    ema: Ema,
    kalman: Option<Kalman1d>,
    estimate: Option<f32>,
}

impl SignalPipeline {
    pub fn new(cfg: &FilterCfg) -> Self {
        Self {
            ema: Ema::new(cfg.ema_alpha),
            kalman: cfg.kalman.map(Kalman1d::from),
            estimate: None,
        }
    }

    /// Filter one reading. Invalid readings leave all state untouched.
    pub fn update(&mut self, reading: &WeightReading) -> Option<f32> {
        if !reading.is_usable() {
            return None;
        }
        let smoothed = self.ema.update(reading.weight_g);
        let out = match self.kalman.as_mut() {
            Some(k) => k.update(smoothed),
            None => smoothed,
        };
        self.estimate = Some(out);
        Some(out)
    }

    pub fn estimate(&self) -> Option<f32> {
        self.estimate
    }

    pub fn reset(&mut self) {
        self.ema.reset();
        if let Some(k) = self.kalman.as_mut() {
            k.reset();
        }
        self.estimate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn first_sample_seeds_without_bias() {
        let mut ema = Ema::new(0.3);
        assert_eq!(ema.update(500.0), 500.0);
        let y = ema.update(490.0);
        assert!((y - 497.0).abs() < 1e-4, "y = {y}");
    }

    #[rstest]
    #[case(0.0)]
    #[case(-0.5)]
    #[case(f32::NAN)]
    #[case(3.0)]
    fn out_of_range_alpha_is_passthrough(#[case] alpha: f32) {
        let ema = Ema::new(alpha);
        assert_eq!(ema.alpha(), 1.0);
    }

    proptest! {
        #[test]
        fn alpha_one_is_identity(xs in proptest::collection::vec(-1000.0f32..1000.0, 1..50)) {
            let mut ema = Ema::new(1.0);
            for x in xs {
                prop_assert_eq!(ema.update(x), x);
            }
        }

        #[test]
        fn constant_input_converges(alpha in 0.05f32..=1.0, seed in 0.0f32..1000.0, c in 0.0f32..1000.0) {
            let mut ema = Ema::new(alpha);
            ema.update(seed);
            let mut y = seed;
            for _ in 0..2000 {
                y = ema.update(c);
            }
            prop_assert!((y - c).abs() < 1e-2, "y = {} c = {}", y, c);
        }

        #[test]
        fn estimator_moves_monotonically_with_shrinking_gain(
            x0 in -100.0f32..100.0,
            z in -100.0f32..100.0,
            r in 0.01f32..10.0,
        ) {
            let mut k = Kalman1d::with_estimate(0.0, r, x0);
            let mut prev_x = x0;
            let mut prev_gain = f32::INFINITY;
            let rising = z >= x0;
            for _ in 0..50 {
                let x = k.update(z);
                if rising {
                    prop_assert!(x >= prev_x - 1e-4 && x <= z + 1e-4);
                } else {
                    prop_assert!(x <= prev_x + 1e-4 && x >= z - 1e-4);
                }
                prop_assert!(k.gain() < prev_gain);
                prev_x = x;
                prev_gain = k.gain();
            }
        }
    }

    #[test]
    fn invalid_reading_does_not_touch_state() {
        let mut p = SignalPipeline::new(&FilterCfg::default());
        assert_eq!(p.update(&WeightReading::new(100.0, 0)), Some(100.0));
        assert_eq!(p.update(&WeightReading::invalid(100)), None);
        let mut garbage = WeightReading::new(0.0, 200);
        garbage.valid = false;
        assert_eq!(p.update(&garbage), None);
        assert_eq!(p.estimate(), Some(100.0));
        // Next valid sample blends against the untouched 100.0.
        let y = p.update(&WeightReading::new(90.0, 300)).unwrap();
        assert!((y - 97.0).abs() < 1e-4);
    }

    #[test]
    fn cascade_seeds_estimator_from_first_ema_output() {
        let cfg = FilterCfg {
            ema_alpha: 0.5,
            kalman: Some(KalmanCfg { q: 0.01, r: 0.5 }),
        };
        let mut p = SignalPipeline::new(&cfg);
        assert_eq!(p.update(&WeightReading::new(400.0, 0)), Some(400.0));
        let y = p.update(&WeightReading::new(300.0, 100)).unwrap();
        // EMA gives 350; the estimator only moves part of the way there.
        assert!(y < 400.0 && y > 350.0, "y = {y}");
        p.reset();
        assert_eq!(p.estimate(), None);
    }
}
