//! The fixed-cadence monitoring loop.
//!
//! One cycle:
//!
//! 1. Apply a pending config reload (only ever at a cycle boundary).
//! 2. Take the reading; a missing, invalid or out-of-order one reuses the
//!    last valid weight and bumps the staleness counter.
//! 3. Filter, then feed the flow window.
//! 4. Past `max_stale_cycles`: force `Error` and raise `SensorFail` once.
//! 5. Otherwise, while infusing: evaluate, reconcile the device state with
//!    the event, then run the actuation step (clamp on hazards, clamp on low
//!    fluid after the configured delay).
//! 6. Publish weight and flow every cycle; alarm and state only on change.
//!
//! `cycle` is deterministic given its input, so tests drive it directly.
//! `run`/`spawn` wrap it with a sampler, a clock and a shutdown flag.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as xch;
use drip_traits::Clock;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{EventBus, Payload};
use crate::config::MonitorCfg;
use crate::error::TransitionError;
use crate::filter::SignalPipeline;
use crate::flow::{FlowCalculator, FlowData};
use crate::safety::{SafetyEvaluator, SafetyEvent, SafetyInputs};
use crate::sampler::Sampler;
use crate::state::{DeviceState, StateMachine};
use crate::types::{AlarmKind, WeightReading};
use crate::util::ms_between;
use crate::watchdog::Heartbeat;

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// State at the end of the cycle.
    pub state: DeviceState,
    /// Evaluator output; `None` when it did not run.
    pub event: SafetyEvent,
    pub evaluated: bool,
    pub alarm: AlarmKind,
    /// Filtered weight used this cycle (possibly reused).
    pub weight_g: Option<f32>,
    pub flow: Option<FlowData>,
    pub stale_cycles: u32,
    /// Transitions applied during this cycle.
    pub transitions: u8,
    pub rejected: Option<TransitionError>,
}

/// Totals returned when `run` exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub cycles: u64,
    pub overruns: u64,
    pub out_of_order: u64,
}

pub type AirCheck = Box<dyn Fn() -> bool + Send>;

pub struct MonitorLoop {
    cfg: MonitorCfg,
    pipeline: SignalPipeline,
    flow: FlowCalculator,
    evaluator: SafetyEvaluator,
    machine: Arc<StateMachine>,
    bus: Arc<EventBus>,
    air_check: Option<AirCheck>,
    heartbeat: Option<Heartbeat>,
    reload_rx: Option<xch::Receiver<MonitorCfg>>,
    expected_rate_ml_min: f32,

    last_valid: Option<WeightReading>,
    stale_cycles: u32,
    sensor_fail_reported: bool,
    was_infusing: bool,
    prev_event: SafetyEvent,
    alarm: AlarmKind,
    published_state: DeviceState,
    low_fluid_since_ms: Option<u32>,
    out_of_order: u64,
    cycles: u64,
}

impl MonitorLoop {
    pub fn new(cfg: MonitorCfg, machine: Arc<StateMachine>, bus: Arc<EventBus>) -> Self {
        let published_state = machine.current();
        Self {
            pipeline: SignalPipeline::new(&cfg.filter),
            flow: FlowCalculator::new(cfg.flow.window_samples, cfg.flow.density_g_per_ml),
            evaluator: SafetyEvaluator::new(&cfg.safety),
            expected_rate_ml_min: cfg.safety.default_expected_rate_ml_min,
            cfg,
            machine,
            bus,
            air_check: None,
            heartbeat: None,
            reload_rx: None,
            last_valid: None,
            stale_cycles: 0,
            sensor_fail_reported: false,
            was_infusing: false,
            prev_event: SafetyEvent::None,
            alarm: AlarmKind::None,
            published_state,
            low_fluid_since_ms: None,
            out_of_order: 0,
            cycles: 0,
        }
    }

    /// External air-in-line signal, polled once per evaluation.
    pub fn with_air_check(mut self, check: AirCheck) -> Self {
        self.air_check = Some(check);
        self
    }

    /// Fed after every completed cycle.
    pub fn with_heartbeat(mut self, hb: Heartbeat) -> Self {
        self.heartbeat = Some(hb);
        self
    }

    /// Channel for live reloads; the newest pending config wins.
    pub fn reload_channel(&mut self) -> xch::Sender<MonitorCfg> {
        let (tx, rx) = xch::bounded(4);
        self.reload_rx = Some(rx);
        tx
    }

    /// Prescribed rate for the free-flow detector.
    pub fn set_expected_rate(&mut self, ml_min: f32) {
        self.expected_rate_ml_min = ml_min;
    }

    pub fn config(&self) -> &MonitorCfg {
        &self.cfg
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn stale_cycles(&self) -> u32 {
        self.stale_cycles
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    fn apply_reload(&mut self) {
        let Some(rx) = &self.reload_rx else {
            return;
        };
        let Some(cfg) = rx.try_iter().last() else {
            return;
        };
        if cfg.filter != self.cfg.filter {
            self.pipeline = SignalPipeline::new(&cfg.filter);
        }
        if cfg.flow != self.cfg.flow {
            self.flow = FlowCalculator::new(cfg.flow.window_samples, cfg.flow.density_g_per_ml);
        }
        if cfg.safety != self.cfg.safety {
            self.evaluator.reconfigure(&cfg.safety);
        }
        self.cfg = cfg;
        info!("monitor configuration reloaded");
    }

    fn in_order(&mut self, r: &WeightReading) -> bool {
        match self.last_valid {
            Some(prev) if ms_between(prev.timestamp_ms, r.timestamp_ms) > u32::MAX / 2 => {
                self.out_of_order += 1;
                debug!(
                    prev_ms = prev.timestamp_ms,
                    ts_ms = r.timestamp_ms,
                    "out-of-order reading dropped"
                );
                false
            }
            _ => true,
        }
    }

    fn start_infusion(&mut self) {
        self.evaluator.reset();
        self.flow.reset();
        self.low_fluid_since_ms = None;
        self.prev_event = SafetyEvent::None;
        info!("infusion monitoring started");
    }

    fn note_state(&mut self, state: DeviceState) {
        if state != self.published_state {
            self.published_state = state;
            self.bus.emit(Payload::State(state));
        }
    }

    fn set_alarm(&mut self, kind: AlarmKind) {
        if kind != self.alarm {
            self.alarm = kind;
            self.bus.emit(Payload::Alarm(kind));
            match kind {
                AlarmKind::None => info!("alarm cleared"),
                _ => error!(alarm = %kind, "alarm raised"),
            }
        }
    }

    fn try_transition(&mut self, to: DeviceState, report: &mut CycleReport) {
        match self.machine.transition(to) {
            Ok(t) => {
                report.transitions += 1;
                self.note_state(t.to);
            }
            Err(e @ TransitionError::Rejected { .. }) => {
                warn!(error = %e, "transition rejected");
                report.rejected = Some(e);
            }
            Err(e @ TransitionError::Actuator { .. }) => {
                error!(error = %e, "clamp actuation failed");
                report.rejected = Some(e);
                let now = self.machine.current();
                self.note_state(now);
            }
        }
    }

    /// Bring the device state in line with the event.
    fn reconcile(&mut self, event: SafetyEvent, report: &mut CycleReport) {
        let state = self.machine.current();
        let desired = match event {
            SafetyEvent::None => DeviceState::Monitoring,
            SafetyEvent::LowFluid => DeviceState::LowFluid,
            SafetyEvent::FreeFlow => DeviceState::FreeFlow,
            SafetyEvent::AirDetect => DeviceState::AirDetect,
            // Alarm only; no state of its own.
            SafetyEvent::FlowStall => return,
        };
        if desired == state {
            return;
        }
        let target = if state.can_transition_to(desired) {
            desired
        } else if event.is_hazard() && state.can_transition_to(DeviceState::Clamped) {
            DeviceState::Clamped
        } else if event != self.prev_event {
            // Surface the rejection once per event change; never retried.
            desired
        } else {
            return;
        };
        self.try_transition(target, report);
    }

    /// Clamp on hazards at once, and on low fluid after the configured delay.
    fn actuate(&mut self, now_ms: u32, report: &mut CycleReport) {
        match self.machine.current() {
            DeviceState::FreeFlow | DeviceState::AirDetect => {
                self.low_fluid_since_ms = None;
                self.try_transition(DeviceState::Clamped, report);
            }
            DeviceState::LowFluid => {
                let since = *self.low_fluid_since_ms.get_or_insert(now_ms);
                let waited = u64::from(ms_between(since, now_ms));
                if waited >= self.cfg.timing.low_fluid_clamp_delay_ms {
                    info!(waited_ms = waited, "low fluid persisted; clamping");
                    self.low_fluid_since_ms = None;
                    self.try_transition(DeviceState::Clamped, report);
                }
            }
            _ => self.low_fluid_since_ms = None,
        }
    }

    /// Run one cycle with the reading acquired for it (`None` on timeout).
    pub fn cycle(&mut self, reading: Option<WeightReading>) -> CycleReport {
        self.apply_reload();
        self.cycles += 1;

        let mut state = self.machine.current();
        self.note_state(state);
        if state.is_infusing() && !self.was_infusing {
            self.start_infusion();
        }

        let fresh = reading
            .filter(WeightReading::is_usable)
            .filter(|r| self.in_order(r));
        let current = match fresh {
            Some(r) => {
                self.stale_cycles = 0;
                self.sensor_fail_reported = false;
                let w = self.pipeline.update(&r).unwrap_or(r.weight_g);
                self.flow.update(w, r.timestamp_ms);
                let filtered = WeightReading {
                    weight_g: w,
                    timestamp_ms: r.timestamp_ms,
                    valid: true,
                };
                self.last_valid = Some(filtered);
                Some(filtered)
            }
            None => {
                self.stale_cycles = self.stale_cycles.saturating_add(1);
                trace!(stale_cycles = self.stale_cycles, "no fresh reading this cycle");
                self.last_valid
            }
        };

        let mut report = CycleReport {
            state,
            event: SafetyEvent::None,
            evaluated: false,
            alarm: self.alarm,
            weight_g: current.map(|r| r.weight_g),
            flow: None,
            stale_cycles: self.stale_cycles,
            transitions: 0,
            rejected: None,
        };

        if self.stale_cycles > self.cfg.timing.max_stale_cycles {
            if !self.sensor_fail_reported {
                self.sensor_fail_reported = true;
                error!(
                    stale_cycles = self.stale_cycles,
                    "load cell stale; forcing ERROR"
                );
                self.set_alarm(AlarmKind::SensorFail);
                if state != DeviceState::Error {
                    self.try_transition(DeviceState::Error, &mut report);
                }
            }
        } else if let Some(w) = current.filter(|_| state.is_infusing()) {
            let inputs = SafetyInputs {
                weight_g: w.weight_g,
                timestamp_ms: w.timestamp_ms,
                flow: self.flow.latest(),
                expected_rate_ml_min: self.expected_rate_ml_min,
                air_detected: self.air_check.as_ref().is_some_and(|check| check()),
            };
            let event = self.evaluator.evaluate_safety(&inputs);
            report.event = event;
            report.evaluated = true;
            if event != self.prev_event {
                debug!(from = %self.prev_event, to = %event, weight_g = w.weight_g, "safety event changed");
            }
            self.reconcile(event, &mut report);
            self.actuate(w.timestamp_ms, &mut report);
            self.prev_event = event;
            self.set_alarm(AlarmKind::from(event));
        } else if state == DeviceState::Idle {
            self.set_alarm(AlarmKind::None);
        }

        if let Some(w) = current {
            self.bus.emit(Payload::Weight(w.weight_g));
        }
        let flow = self.flow.latest();
        if let Some(f) = flow {
            self.bus.emit(Payload::Flow(f));
        }

        state = self.machine.current();
        self.note_state(state);
        self.was_infusing = state.is_infusing();

        report.state = state;
        report.alarm = self.alarm;
        report.flow = flow;

        if let Some(hb) = &self.heartbeat {
            hb.feed();
        }
        trace!(
            state = %report.state,
            event = %report.event,
            weight_g = ?report.weight_g,
            stale = report.stale_cycles,
            "cycle"
        );
        report
    }

    /// Cycle until `shutdown` is set, pacing to the configured period.
    pub fn run<C: Clock>(
        &mut self,
        sampler: &Sampler,
        clock: &C,
        shutdown: &AtomicBool,
    ) -> MonitorSummary {
        let mut summary = MonitorSummary::default();
        info!(period_ms = self.cfg.timing.period_ms, "monitor loop started");
        while !shutdown.load(Ordering::Relaxed) {
            let start = clock.now();
            let period = Duration::from_millis(self.cfg.timing.period_ms);
            let wait = Duration::from_millis(self.cfg.timing.sensor_timeout_ms);
            let reading = sampler.recv_timeout(wait);
            self.cycle(reading);
            summary.cycles += 1;

            let elapsed = clock.now().saturating_duration_since(start);
            match period.checked_sub(elapsed) {
                Some(rest) => clock.sleep(rest),
                None => {
                    summary.overruns += 1;
                    debug!(elapsed_ms = elapsed.as_millis() as u64, "cycle overran its period");
                }
            }
        }
        summary.out_of_order = self.out_of_order;
        info!(cycles = summary.cycles, overruns = summary.overruns, "monitor loop stopped");
        summary
    }

    /// Run on a dedicated `monitor` thread. `on_start` runs first on that
    /// thread (scheduling policy, affinity).
    pub fn spawn<C: Clock + Send + 'static>(
        mut self,
        sampler: Sampler,
        clock: C,
        shutdown: Arc<AtomicBool>,
        on_start: Option<Box<dyn FnOnce() + Send>>,
    ) -> std::io::Result<JoinHandle<MonitorSummary>> {
        std::thread::Builder::new()
            .name("monitor".into())
            .spawn(move || {
                if let Some(f) = on_start {
                    f();
                }
                self.run(&sampler, &clock, &shutdown)
            })
    }
}
