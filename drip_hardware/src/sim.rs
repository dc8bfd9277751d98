//! Simulated load cell and clamp.
//!
//! The load cell models an IV bag on an HX711: a true weight that drains by a
//! fixed amount per conversion, converted to raw counts with a fixed tare and
//! gain and back to grams with whatever calibration was installed. A cloned
//! `SimHandle` lets tests and the CLI reshape the bag while the sampler owns
//! the device.
use std::collections::VecDeque;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use drip_traits::{BoxError, ClampActuator, LoadCell};
use tracing::trace;

use crate::error::HwError;

/// Raw counts at zero load.
pub const SIM_TARE_COUNTS: i32 = 842_913;
/// Grams per raw count.
pub const SIM_SCALE_G_PER_COUNT: f32 = 0.0025;

#[derive(Debug)]
struct BagState {
    weight_g: f32,
    drain_g_per_read: f32,
    script: VecDeque<f32>,
    failing: bool,
    reads: u64,
}

impl BagState {
    fn next_weight(&mut self) -> f32 {
        if let Some(w) = self.script.pop_front() {
            self.weight_g = w;
        } else {
            self.weight_g = (self.weight_g - self.drain_g_per_read).max(0.0);
        }
        self.reads += 1;
        self.weight_g
    }
}

/// Control side of a `SimulatedLoadCell`.
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<BagState>>,
}

impl SimHandle {
    fn with<R>(&self, f: impl FnOnce(&mut BagState) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut s| f(&mut s))
    }

    pub fn set_weight(&self, grams: f32) {
        self.with(|s| s.weight_g = grams);
    }

    pub fn set_drain(&self, grams_per_read: f32) {
        self.with(|s| s.drain_g_per_read = grams_per_read);
    }

    /// Queue explicit weights to be returned before draining resumes.
    pub fn push_script(&self, weights: impl IntoIterator<Item = f32>) {
        self.with(|s| s.script.extend(weights));
    }

    /// While set, every read fails with a timeout.
    pub fn set_failing(&self, failing: bool) {
        self.with(|s| s.failing = failing);
    }

    pub fn weight(&self) -> f32 {
        self.with(|s| s.weight_g).unwrap_or(0.0)
    }

    pub fn reads(&self) -> u64 {
        self.with(|s| s.reads).unwrap_or(0)
    }
}

pub struct SimulatedLoadCell {
    state: Arc<Mutex<BagState>>,
    offset_counts: i32,
    scale_g_per_count: f32,
}

impl SimulatedLoadCell {
    /// A bag holding `initial_g` that loses `drain_g_per_read` on every conversion.
    pub fn draining(initial_g: f32, drain_g_per_read: f32) -> (Self, SimHandle) {
        Self::build(BagState {
            weight_g: initial_g,
            drain_g_per_read,
            script: VecDeque::new(),
            failing: false,
            reads: 0,
        })
    }

    /// Plays `weights` back in order, then holds the last value.
    pub fn scripted(weights: impl IntoIterator<Item = f32>) -> (Self, SimHandle) {
        let script: VecDeque<f32> = weights.into_iter().collect();
        let first = script.front().copied().unwrap_or(0.0);
        Self::build(BagState {
            weight_g: first,
            drain_g_per_read: 0.0,
            script,
            failing: false,
            reads: 0,
        })
    }

    fn build(state: BagState) -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(state));
        let handle = SimHandle {
            state: state.clone(),
        };
        (
            Self {
                state,
                offset_counts: SIM_TARE_COUNTS,
                scale_g_per_count: SIM_SCALE_G_PER_COUNT,
            },
            handle,
        )
    }

    fn convert(&mut self) -> Result<i32, HwError> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| HwError::Gpio("simulated bag state poisoned".into()))?;
        if st.failing {
            return Err(HwError::Timeout);
        }
        let grams = st.next_weight();
        let raw = SIM_TARE_COUNTS + (grams / SIM_SCALE_G_PER_COUNT).round() as i32;
        trace!(raw, grams, "sim load cell conversion");
        Ok(raw)
    }
}

impl LoadCell for SimulatedLoadCell {
    fn is_ready(&mut self) -> bool {
        self.state.lock().map(|s| !s.failing).unwrap_or(false)
    }

    fn read_grams(&mut self, _timeout: Duration) -> Result<f32, BoxError> {
        let raw = self.convert()?;
        Ok(raw.saturating_sub(self.offset_counts) as f32 * self.scale_g_per_count)
    }

    fn read_raw(&mut self, _timeout: Duration) -> Result<i32, BoxError> {
        Ok(self.convert()?)
    }

    fn set_calibration(&mut self, offset_counts: i32, scale_g_per_count: f32) {
        self.offset_counts = offset_counts;
        self.scale_g_per_count = scale_g_per_count;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClampCommand {
    Clamp,
    Release,
    Detach,
}

/// Shared view of the commands a `SimulatedClamp` has received.
#[derive(Debug, Clone, Default)]
pub struct ClampLog {
    commands: Arc<Mutex<Vec<ClampCommand>>>,
    fail_clamp: Arc<AtomicBool>,
}

impl ClampLog {
    pub fn commands(&self) -> Vec<ClampCommand> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// True when the last position command was `Clamp`.
    pub fn is_clamped(&self) -> bool {
        self.commands()
            .iter()
            .rev()
            .find(|c| **c != ClampCommand::Detach)
            .is_some_and(|c| *c == ClampCommand::Clamp)
    }

    /// Make subsequent `clamp` commands fail (stuck servo).
    pub fn set_fail_clamp(&self, fail: bool) {
        self.fail_clamp.store(fail, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedClamp {
    log: ClampLog,
}

impl SimulatedClamp {
    pub fn new() -> (Self, ClampLog) {
        let log = ClampLog::default();
        (Self { log: log.clone() }, log)
    }

    fn record(&self, cmd: ClampCommand) {
        if let Ok(mut c) = self.log.commands.lock() {
            c.push(cmd);
        }
    }
}

impl ClampActuator for SimulatedClamp {
    fn clamp(&mut self) -> Result<(), BoxError> {
        if self.log.fail_clamp.load(Ordering::Relaxed) {
            return Err(Box::new(HwError::Pwm("servo did not respond".into())));
        }
        self.record(ClampCommand::Clamp);
        Ok(())
    }

    fn release(&mut self) -> Result<(), BoxError> {
        self.record(ClampCommand::Release);
        Ok(())
    }

    fn detach(&mut self) -> Result<(), BoxError> {
        self.record(ClampCommand::Detach);
        Ok(())
    }
}
