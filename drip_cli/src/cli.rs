//! CLI argument definitions and shared statics.

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "dripsense", version, about = "IV drip monitor")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/dripsense.toml")]
    pub config: PathBuf,

    /// Optional calibration CSV (strict `raw,grams` header)
    #[arg(long, value_name = "FILE")]
    pub calibration: Option<PathBuf>,

    /// Emit JSON lines (telemetry, results, errors) instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Memory locking mode for real-time operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RtLock {
    /// Do not lock memory
    None,
    /// Lock currently resident pages
    Current,
    /// Lock current and future pages
    All,
}

impl RtLock {
    #[inline]
    pub fn os_default() -> Self {
        if cfg!(target_os = "linux") {
            RtLock::Current
        } else {
            RtLock::None
        }
    }
}

/// Real-time knobs for the monitor thread.
#[derive(Args, Debug, Clone, Copy)]
pub struct RtArgs {
    /// Run the monitor thread under SCHED_FIFO, pinned to one CPU
    #[arg(
        long,
        action = ArgAction::SetTrue,
        long_help = "Enable real-time mode for the monitor thread.\n\nLinux: SCHED_FIFO priority, pinned to one CPU, and mlockall according to --rt-lock. Usually needs CAP_SYS_NICE and CAP_IPC_LOCK (or root).\n\nOther OSes: ignored with a warning."
    )]
    pub rt: bool,
    /// SCHED_FIFO priority (1..=max); defaults to the system maximum
    #[arg(long, value_name = "PRIO")]
    pub rt_prio: Option<i32>,
    /// Memory locking mode for --rt
    #[arg(long, value_enum, value_name = "MODE")]
    pub rt_lock: Option<RtLock>,
    /// CPU index to pin the monitor thread to (default 0)
    #[arg(long, value_name = "CPU")]
    pub rt_cpu: Option<usize>,
}

/// Simulated bag used when built without the `hardware` feature.
#[derive(Args, Debug, Clone, Copy)]
pub struct SimArgs {
    /// Starting bag weight in grams
    #[arg(long, value_name = "GRAMS", default_value_t = 500.0)]
    pub sim_initial_g: f32,
    /// Drain rate in grams per second
    #[arg(long, value_name = "G_PER_S", default_value_t = 1.7)]
    pub sim_drain_g_per_s: f32,
    /// Make the load cell stop answering after this many seconds
    #[arg(long, value_name = "SECS")]
    pub sim_fail_after_s: Option<f32>,
    /// Raise the air-in-line signal after this many seconds
    #[arg(long, value_name = "SECS")]
    pub sim_air_after_s: Option<f32>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the monitoring loop until Ctrl-C (or --duration-s)
    Monitor {
        /// Prescribed rate in mL/min (overrides flow.expected_rate_ml_min)
        #[arg(long, value_name = "ML_MIN")]
        expected_rate: Option<f32>,
        /// Stop after this many seconds
        #[arg(long, value_name = "SECS")]
        duration_s: Option<f64>,
        /// Disable the software watchdog
        #[arg(long, action = ArgAction::SetTrue)]
        no_watchdog: bool,
        #[command(flatten)]
        rt: RtArgs,
        #[command(flatten)]
        sim: SimArgs,
    },
    /// Tare the load cell and derive its scale from a reference mass
    Calibrate {
        /// Reference mass in grams
        #[arg(long, value_name = "GRAMS")]
        known_mass_g: f32,
        /// Raw reads averaged per step
        #[arg(long, default_value_t = drip_core::calibration::TARE_SAMPLES)]
        samples: usize,
        /// Time given to hang the reference mass
        #[arg(long, value_name = "MS", default_value_t = 2_000)]
        settle_ms: u64,
    },
    /// Quick health check (hardware presence / sim ok)
    SelfCheck,
    /// Print the device state transition table
    Transitions,
}
