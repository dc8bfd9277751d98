//! Hardware assembly and the `monitor`, `calibrate` and `self-check` runs.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use drip_config::{Config, PersistedCalibration};
use drip_core::bus::Dispatcher;
use drip_core::calibration::Calibrator;
use drip_core::monitor::MonitorSummary;
use drip_core::sampler::Sampler;
use drip_core::watchdog::{Heartbeat, Watchdog};
use drip_core::{
    AlarmKind, DeviceState, DeviceStatus, EventBus, MonitorCfg, MonitorLoop, Payload, Request,
    StateMachine, Topic,
};
use drip_traits::{ClampActuator, LoadCell, MonotonicClock};
use eyre::WrapErr;
use serde_json::json;
use thiserror::Error;

use crate::cli::SimArgs;
use crate::error_fmt::WATCHDOG_EXIT_CODE;
use crate::rt::{RtPlan, apply_to_current_thread};

/// A monitoring run that stopped with an alarm still raised.
#[derive(Debug, Error)]
#[error("monitoring ended in {state} with alarm {alarm}")]
pub struct MonitorEnded {
    pub state: DeviceState,
    pub alarm: AlarmKind,
}

/// Knobs for the simulated bag, driven from the supervising thread.
pub struct SimControls {
    pub bag: drip_hardware::SimHandle,
    pub clamp: drip_hardware::ClampLog,
    pub air: Arc<AtomicBool>,
}

pub struct Hardware {
    pub cell: Box<dyn LoadCell + Send>,
    pub clamp: Box<dyn ClampActuator + Send>,
    /// Present only for the simulated backend.
    pub sim: Option<SimControls>,
}

#[cfg(feature = "hardware")]
pub fn open_hardware(cfg: &Config, _sim: &SimArgs) -> eyre::Result<Hardware> {
    use drip_hardware::hx711::Hx711;
    use drip_hardware::servo::{GpioPulse, ServoClamp, ServoPositions};

    let cell = Hx711::open(cfg.pins.hx711_dout, cfg.pins.hx711_sck).wrap_err("open hx711")?;
    let positions = ServoPositions {
        clamp_angle: cfg.clamp.clamp_angle,
        open_angle: cfg.clamp.open_angle,
        step_delay: Duration::from_millis(cfg.clamp.smooth_step_delay_ms),
    };
    let pulse = GpioPulse::open(cfg.pins.servo_pwm).wrap_err("open servo pin")?;
    let clamp = ServoClamp::new(pulse, MonotonicClock::new(), positions).wrap_err("servo setup")?;
    tracing::info!(
        dout = cfg.pins.hx711_dout,
        sck = cfg.pins.hx711_sck,
        servo = cfg.pins.servo_pwm,
        "hardware backend ready"
    );
    Ok(Hardware {
        cell: Box::new(cell),
        clamp: Box::new(clamp),
        sim: None,
    })
}

#[cfg(not(feature = "hardware"))]
pub fn open_hardware(cfg: &Config, sim: &SimArgs) -> eyre::Result<Hardware> {
    use drip_hardware::{SimulatedClamp, SimulatedLoadCell};

    let per_read = sim.sim_drain_g_per_s / cfg.sampling.sample_rate_hz.max(1) as f32;
    let (cell, bag) = SimulatedLoadCell::draining(sim.sim_initial_g, per_read);
    let (clamp, log) = SimulatedClamp::new();
    tracing::info!(
        initial_g = sim.sim_initial_g,
        drain_g_per_s = sim.sim_drain_g_per_s,
        "simulated backend ready"
    );
    Ok(Hardware {
        cell: Box::new(cell),
        clamp: Box::new(clamp),
        sim: Some(SimControls {
            bag,
            clamp: log,
            air: Arc::new(AtomicBool::new(false)),
        }),
    })
}

pub struct RunOpts {
    pub expected_rate_ml_min: Option<f32>,
    pub duration: Option<Duration>,
    pub watchdog: bool,
    pub rt: Option<RtPlan>,
    pub sim: SimArgs,
}

pub struct RunResult {
    pub summary: MonitorSummary,
    pub status: DeviceStatus,
}

type SharedStatus = Arc<Mutex<DeviceStatus>>;

fn snapshot(status: &SharedStatus) -> DeviceStatus {
    *status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fold bus traffic into one status snapshot.
fn spawn_status_feed(bus: &EventBus, status: &SharedStatus) -> eyre::Result<Vec<Dispatcher>> {
    [
        Topic::WeightUpdate,
        Topic::FlowUpdate,
        Topic::Alarm,
        Topic::StateChange,
        Topic::WifiStatus,
    ]
    .into_iter()
    .map(|topic| {
        let status = status.clone();
        bus.subscribe_fn(topic, "status", move |ev| {
            status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(&ev);
        })
        .wrap_err_with(|| format!("subscribe status feed to {topic}"))
    })
    .collect()
}

fn spawn_buzzer(bus: &EventBus) -> eyre::Result<Dispatcher> {
    bus.subscribe_fn(Topic::Alarm, "buzzer", |ev| {
        if let Payload::Alarm(alarm) = ev.payload {
            tracing::info!(%alarm, pattern = ?alarm.buzzer_pattern(), "buzzer");
        }
    })
    .wrap_err("subscribe buzzer")
}

/// Run `tick` every `period` until `stop` is set.
fn spawn_ticker<F>(
    name: &str,
    period: Duration,
    stop: Arc<AtomicBool>,
    mut tick: F,
) -> eyre::Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    let slice = Duration::from_millis(20).min(period);
    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let mut next = Instant::now() + period;
            while !stop.load(Ordering::Relaxed) {
                if Instant::now() >= next {
                    tick();
                    next += period;
                }
                std::thread::sleep(slice);
            }
        })
        .wrap_err_with(|| format!("spawn {name} thread"))
}

pub fn render_status_line(s: &DeviceStatus) -> String {
    let weight = s
        .weight_g
        .map_or_else(|| "--".to_string(), |w| format!("{w:.1} g"));
    let flow = s
        .flow
        .map_or_else(|| "--".to_string(), |f| format!("{:.1} mL/min", f.rate_ml_min));
    let eta = s
        .eta_min()
        .map_or_else(|| "--".to_string(), |m| format!("{m:.0} min"));
    let mut line = format!("{:<11} weight {weight:>9}  flow {flow:>13}  eta {eta}", s.state.name());
    if s.alarm != AlarmKind::None {
        line.push_str(&format!("  ALARM {}", s.alarm));
    }
    line
}

pub fn status_json(kind: &str, device_id: &str, s: &DeviceStatus) -> serde_json::Value {
    json!({
        "type": kind,
        "device_id": device_id,
        "uptime_s": s.uptime_s,
        "state": s.state.name(),
        "alarm": s.alarm.name(),
        "weight_g": s.weight_g,
        "flow_ml_min": s.flow.map(|f| f.rate_ml_min),
        "eta_min": s.eta_min(),
        "wifi": s.wifi_connected,
    })
}

fn print_line(line: &str) {
    let mut out = std::io::stdout().lock();
    // A closed stdout must not take the monitor down.
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn apply_calibration(cell: &mut dyn LoadCell, calib: Option<PersistedCalibration>) {
    if let Some(c) = calib {
        cell.set_calibration(c.offset_counts, c.scale_g_per_count);
        tracing::info!(
            offset_counts = c.offset_counts,
            scale_g_per_count = c.scale_g_per_count,
            "calibration applied"
        );
    }
}

pub fn run_monitor(
    cfg: &Config,
    calib: Option<PersistedCalibration>,
    opts: &RunOpts,
    json_mode: bool,
    shutdown: Arc<AtomicBool>,
) -> eyre::Result<RunResult> {
    let Hardware {
        mut cell,
        clamp,
        sim,
    } = open_hardware(cfg, &opts.sim)?;
    apply_calibration(cell.as_mut(), calib);

    let machine = Arc::new(StateMachine::new(clamp));
    let bus = Arc::new(EventBus::new());
    let status: SharedStatus = Arc::new(Mutex::new(DeviceStatus::default()));
    let mut dispatchers = spawn_status_feed(&bus, &status)?;
    dispatchers.push(spawn_buzzer(&bus)?);

    let monitor_cfg = MonitorCfg::from(cfg);
    let heartbeat = Heartbeat::new();
    let mut monitor =
        MonitorLoop::new(monitor_cfg, machine.clone(), bus.clone()).with_heartbeat(heartbeat.clone());
    monitor.set_expected_rate(
        opts.expected_rate_ml_min
            .unwrap_or(cfg.flow.expected_rate_ml_min),
    );
    if let Some(s) = &sim {
        let air = s.air.clone();
        monitor = monitor.with_air_check(Box::new(move || air.load(Ordering::Relaxed)));
    }

    let started = Instant::now();
    let reporters_stop = Arc::new(AtomicBool::new(false));
    let reporter = if json_mode {
        let (status, id) = (status.clone(), cfg.telemetry.device_id.clone());
        spawn_ticker(
            "telemetry",
            Duration::from_millis(cfg.telemetry.publish_interval_ms.max(1)),
            reporters_stop.clone(),
            move || {
                let mut s = snapshot(&status);
                s.uptime_s = started.elapsed().as_secs();
                print_line(&status_json("telemetry", &id, &s).to_string());
            },
        )?
    } else {
        let status = status.clone();
        spawn_ticker(
            "display",
            Duration::from_millis(cfg.display.refresh_ms.max(1)),
            reporters_stop.clone(),
            move || print_line(&render_status_line(&snapshot(&status))),
        )?
    };

    let watchdog = opts.watchdog.then(|| {
        Watchdog::spawn(
            (&cfg.watchdog).into(),
            MonotonicClock::new(),
            heartbeat,
            Box::new(|missed| {
                tracing::error!(missed, "monitor loop unresponsive; exiting");
                std::process::exit(WATCHDOG_EXIT_CODE);
            }),
        )
    });

    let sampler = Sampler::spawn(
        cell,
        cfg.sampling.sample_rate_hz,
        Duration::from_millis(cfg.sampling.sensor_timeout_ms),
        MonotonicClock::new(),
    );
    machine
        .request(Request::StartMonitoring)
        .wrap_err("start monitoring")?;

    let on_start: Option<Box<dyn FnOnce() + Send>> = opts.rt.map(|plan| {
        Box::new(move || {
            apply_to_current_thread(&plan);
        }) as Box<dyn FnOnce() + Send>
    });
    let handle = monitor
        .spawn(sampler, MonotonicClock::new(), shutdown.clone(), on_start)
        .wrap_err("spawn monitor thread")?;

    let mut sensor_failed = false;
    let mut air_raised = false;
    while !shutdown.load(Ordering::Relaxed) && !handle.is_finished() {
        let elapsed = started.elapsed();
        if opts.duration.is_some_and(|d| elapsed >= d) {
            break;
        }
        if let Some(s) = &sim {
            let secs = elapsed.as_secs_f32();
            if !sensor_failed && opts.sim.sim_fail_after_s.is_some_and(|t| secs >= t) {
                sensor_failed = true;
                tracing::warn!("sim: load cell stops answering");
                s.bag.set_failing(true);
            }
            if !air_raised && opts.sim.sim_air_after_s.is_some_and(|t| secs >= t) {
                air_raised = true;
                tracing::warn!("sim: air in line");
                s.air.store(true, Ordering::Relaxed);
            }
            // A clamped line stops the bag draining.
            if s.clamp.is_clamped() {
                s.bag.set_drain(0.0);
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    shutdown.store(true, Ordering::Relaxed);

    let summary = handle
        .join()
        .map_err(|_| eyre::eyre!("monitor thread panicked"))?;
    drop(watchdog);
    reporters_stop.store(true, Ordering::Relaxed);
    if reporter.join().is_err() {
        tracing::warn!("reporter thread panicked");
    }
    // Dispatchers drain their queues before exiting.
    for d in dispatchers {
        bus.unsubscribe(d.topic(), d.id());
        d.join();
    }

    let mut final_status = snapshot(&status);
    final_status.state = machine.current();
    final_status.uptime_s = started.elapsed().as_secs();
    if let Some(s) = &sim {
        tracing::debug!(reads = s.bag.reads(), clamp = ?s.clamp.commands(), "sim totals");
    }
    tracing::info!(
        cycles = summary.cycles,
        overruns = summary.overruns,
        state = %final_status.state,
        alarm = %final_status.alarm,
        "monitoring finished"
    );
    Ok(RunResult {
        summary,
        status: final_status,
    })
}

/// Tare, wait for the reference mass, then span. Returns the new calibration.
pub fn run_calibration(
    cfg: &Config,
    known_mass_g: f32,
    samples: usize,
    settle: Duration,
) -> eyre::Result<PersistedCalibration> {
    let Hardware {
        mut cell,
        clamp,
        sim,
    } = open_hardware(cfg, &SimArgs {
        sim_initial_g: 0.0,
        sim_drain_g_per_s: 0.0,
        sim_fail_after_s: None,
        sim_air_after_s: None,
    })?;
    let machine = StateMachine::new(clamp);
    machine
        .request(Request::StartCalibration)
        .wrap_err("enter calibration")?;
    let timeout = Duration::from_millis(cfg.sampling.sensor_timeout_ms.max(1) * 4);
    let cal = Calibrator::new(&machine, timeout).with_samples(samples);

    let offset = cal.tare(cell.as_mut())?;
    tracing::info!(known_mass_g, settle_ms = settle.as_millis() as u64, "hang the reference mass");
    if let Some(s) = &sim {
        s.bag.set_weight(known_mass_g);
    }
    std::thread::sleep(settle);
    let result = cal.span(cell.as_mut(), offset, known_mass_g)?;
    cal.apply(cell.as_mut(), &result)?;
    machine
        .request(Request::FinishCalibration)
        .wrap_err("leave calibration")?;
    Ok(result)
}

/// Read a few samples and check the clamp can be constructed.
pub fn self_check(cfg: &Config, calib: Option<PersistedCalibration>) -> eyre::Result<f32> {
    let Hardware {
        mut cell, clamp, ..
    } = open_hardware(cfg, &SimArgs {
        sim_initial_g: 500.0,
        sim_drain_g_per_s: 0.0,
        sim_fail_after_s: None,
        sim_air_after_s: None,
    })?;
    apply_calibration(cell.as_mut(), calib);
    drop(clamp);
    let timeout = Duration::from_millis(cfg.sampling.sensor_timeout_ms.max(1) * 4);
    let mut last = 0.0;
    for _ in 0..3 {
        last = cell.read_grams(timeout).map_err(|e| {
            eyre::Report::new(drip_core::hw_error::map_boxed(&e)).wrap_err("load cell read failed")
        })?;
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_core::FlowData;

    #[test]
    fn status_line_shows_alarm() {
        let s = DeviceStatus {
            weight_g: Some(123.45),
            flow: Some(FlowData {
                rate_ml_min: 60.0,
                time_to_empty_min: 2.0,
            }),
            state: DeviceState::Clamped,
            alarm: AlarmKind::FreeFlow,
            ..DeviceStatus::default()
        };
        let line = render_status_line(&s);
        assert!(line.starts_with("CLAMPED"));
        assert!(line.contains("123.5 g"));
        assert!(line.contains("60.0 mL/min"));
        assert!(line.contains("ALARM free_flow"));
    }

    #[test]
    fn telemetry_has_stable_keys() {
        let v = status_json("telemetry", "dev-1", &DeviceStatus::default());
        for key in [
            "type",
            "device_id",
            "uptime_s",
            "state",
            "alarm",
            "weight_g",
            "flow_ml_min",
            "eta_min",
            "wifi",
        ] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_eq!(v["state"], "IDLE");
        assert!(v["eta_min"].is_null());
    }
}
