#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
//! `dripsense`: run, calibrate and inspect the IV drip monitor.

mod cli;
mod error_fmt;
mod monitor;
mod rt;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use drip_config::{Config, Logging, PersistedCalibration};
use drip_core::error::MonitorError;
use drip_core::{AlarmKind, DeviceState};
use eyre::WrapErr;
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};
use crate::monitor::{MonitorEnded, RunOpts, status_json};
use crate::rt::RtPlan;

fn main() {
    // clap exits with 2 on usage errors.
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    // Pretty reports are for developers; failures are still rendered below.
    let _ = color_eyre::install();

    if let Err(err) = run(cli) {
        let json_mode = JSON_MODE.get().copied().unwrap_or(false);
        if json_mode {
            eprintln!("{}", format_error_json(&err));
        } else {
            eprintln!("error: {err:#}\n{}", humanize(&err));
        }
        tracing::error!(error = %format!("{err:#}"), "dripsense failed");
        std::process::exit(exit_code_for_error(&err));
    }
}

fn run(cli: Cli) -> eyre::Result<()> {
    if let Commands::Transitions = cli.cmd {
        print_transitions(cli.json);
        return Ok(());
    }

    let mut cfg = load_config(&cli.config)?;
    let warnings = cfg.sanitize();
    init_tracing(cli.json, &cli.log_level, &cfg.logging)?;
    for w in &warnings {
        tracing::warn!(field = w.field, found = %w.found, replaced_with = %w.replaced_with, "config value out of range");
    }
    let calib = resolve_calibration(&cfg, cli.calibration.as_deref())?;

    match cli.cmd {
        Commands::Monitor {
            expected_rate,
            duration_s,
            no_watchdog,
            rt,
            sim,
        } => {
            let shutdown = Arc::new(AtomicBool::new(false));
            {
                let flag = shutdown.clone();
                ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
                    .wrap_err("install Ctrl-C handler")?;
            }
            let opts = RunOpts {
                expected_rate_ml_min: expected_rate,
                duration: duration_s
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(Duration::from_secs_f64),
                watchdog: !no_watchdog,
                rt: RtPlan::from_args(&rt),
                sim,
            };
            let res = monitor::run_monitor(&cfg, calib, &opts, cli.json, shutdown)?;
            report_run(&cfg, &res, cli.json);
            if res.status.alarm != AlarmKind::None {
                return Err(MonitorEnded {
                    state: res.status.state,
                    alarm: res.status.alarm,
                }
                .into());
            }
        }
        Commands::Calibrate {
            known_mass_g,
            samples,
            settle_ms,
        } => {
            let result = match cli.calibration.as_deref() {
                // A CSV fit replaces the live procedure.
                Some(_) => calib.ok_or_else(|| eyre::eyre!("calibration CSV produced no fit"))?,
                None => monitor::run_calibration(
                    &cfg,
                    known_mass_g,
                    samples,
                    Duration::from_millis(settle_ms),
                )?,
            };
            if cli.json {
                println!(
                    "{}",
                    json!({
                        "type": "calibration",
                        "offset_counts": result.offset_counts,
                        "scale_g_per_count": result.scale_g_per_count,
                    })
                );
            } else {
                println!("Calibration complete. Add this to your config:\n");
                print!("{}", result.to_toml_snippet());
            }
        }
        Commands::SelfCheck => {
            let grams = monitor::self_check(&cfg, calib)?;
            if cli.json {
                println!("{}", json!({ "type": "self_check", "ok": true, "weight_g": grams }));
            } else {
                println!("self-check ok (load cell reads {grams:.1} g)");
            }
        }
        // Printed before the config is loaded.
        Commands::Transitions => {}
    }
    Ok(())
}

fn load_config(path: &Path) -> eyre::Result<Config> {
    let text = fs::read_to_string(path).map_err(|e| {
        MonitorError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    drip_config::load_toml(&text)
        .map_err(|e| MonitorError::Config(format!("{}: {e}", path.display())))
        .wrap_err("load config")
}

/// `--calibration` CSV wins over a `[calibration]` section.
fn resolve_calibration(
    cfg: &Config,
    csv: Option<&Path>,
) -> eyre::Result<Option<PersistedCalibration>> {
    match csv {
        Some(p) => drip_config::load_calibration_csv(p)
            .map(Some)
            .map_err(|e| MonitorError::Config(format!("{e:#}")).into()),
        None => Ok(cfg.calibration),
    }
}

fn init_tracing(json: bool, level: &str, logging: &Logging) -> eyre::Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .wrap_err_with(|| format!("invalid --log-level '{level}'"))?;
    let console = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(console_filter)
            .boxed()
    };

    let file = match logging.file.as_deref() {
        Some(path) => {
            let path = Path::new(path);
            let dir = path
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre::eyre!("logging.file has no file name: {}", path.display()))?;
            let appender = match logging.rotation.as_deref().unwrap_or("never") {
                "daily" => tracing_appender::rolling::daily(dir, name),
                "hourly" => tracing_appender::rolling::hourly(dir, name),
                _ => tracing_appender::rolling::never(dir, name),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            let file_filter = EnvFilter::try_new(logging.level.as_deref().unwrap_or("info"))
                .wrap_err("invalid logging.level")?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(file_filter)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .wrap_err("install tracing subscriber")
}

fn report_run(cfg: &Config, res: &monitor::RunResult, json_mode: bool) {
    if json_mode {
        let mut v = status_json("result", &cfg.telemetry.device_id, &res.status);
        v["cycles"] = json!(res.summary.cycles);
        v["overruns"] = json!(res.summary.overruns);
        v["out_of_order"] = json!(res.summary.out_of_order);
        println!("{v}");
    } else {
        println!(
            "monitoring complete: {} cycles ({} overruns), final state {}{}",
            res.summary.cycles,
            res.summary.overruns,
            res.status.state,
            match res.status.alarm {
                AlarmKind::None => String::new(),
                a => format!(", alarm {a}"),
            }
        );
    }
}

fn print_transitions(json_mode: bool) {
    if json_mode {
        let table: serde_json::Map<String, serde_json::Value> = DeviceState::ALL
            .iter()
            .map(|s| {
                let targets: Vec<_> = s.allowed_targets().iter().map(|t| t.name()).collect();
                (s.name().to_string(), json!(targets))
            })
            .collect();
        println!("{}", serde_json::Value::Object(table));
    } else {
        for s in DeviceState::ALL {
            let targets: Vec<_> = s.allowed_targets().iter().map(|t| t.name()).collect();
            println!("{:<11} -> {}", s.name(), targets.join(", "));
        }
    }
}
