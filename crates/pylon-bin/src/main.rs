//! Pylon entrypoint: configuration, logging, signal bridge and runtime
//! assembly around the master scheduler.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use core_buffers::BufferPool;
use core_config::{Config, ConfigFile};
use core_events::{FABRIC_FALLBACK_ALLOCS, FABRIC_PARITY_FLIPS, MAC_SEND_FAILURES, RunFlag};
use core_fabric::TaskFabric;
use core_mac::NullMac;
use core_sched::{RunReport, Scheduler};
use core_streamer::{LoopbackStreamer, Streamer};
use core_worker::{WorkerPool, platform};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "pylon", version, about = "Software massive-MIMO base station core")]
struct Args {
    /// Configuration file (JSON). Defaults to `pylon.json` in the working
    /// directory.
    pub config: Option<PathBuf>,
    /// Override `frames_to_test`.
    #[arg(long = "frames")]
    pub frames: Option<u64>,
    /// Override `worker_thread_num` (0 selects single-thread mode).
    #[arg(long = "workers")]
    pub workers: Option<usize>,
    /// Override `log_dir`; log to stderr when unset.
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(report) if report.stalled => ExitCode::from(2),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(target: "runtime", error = format!("{e:#}"), "fatal");
            eprintln!("pylon: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<RunReport> {
    let args = Args::parse();
    let cfg = Arc::new(load_config(&args)?);
    let _log_guard = configure_logging(cfg.raw().log_dir.as_deref())?;
    install_panic_hook();
    info!(
        target: "runtime",
        frame_len = cfg.schedule().frame_len(),
        window = cfg.window(),
        workers = cfg.worker_thread_num(),
        streamers = cfg.socket_thread_num(),
        mac = cfg.mac_enabled(),
        "startup"
    );

    let run = RunFlag::new();
    {
        let run = run.clone();
        ctrlc::set_handler(move || {
            eprintln!("pylon: interrupt, shutting down");
            run.stop();
        })
        .context("install signal handler")?;
    }

    let pool = Arc::new(BufferPool::new(&cfg));
    pool.preload_downlink(&cfg);
    let fabric = Arc::new(TaskFabric::new(cfg.fabric_capacity()));

    let (mac_core, mac_thread) = if cfg.mac_enabled() {
        let (core_side, mac_side) = core_mac::channel(256);
        (Some(core_side), Some(NullMac::spawn(mac_side, run.clone())))
    } else {
        (None, None)
    };

    let workers = if cfg.single_threaded() {
        None
    } else {
        Some(WorkerPool::spawn(
            cfg.clone(),
            pool.clone(),
            fabric.clone(),
            run.clone(),
        )?)
    };

    let mut streamer = LoopbackStreamer::new(
        cfg.clone(),
        pool.clone(),
        fabric.clone(),
        run.clone(),
        cfg.frames_to_test(),
    );
    streamer.start_tx_rx()?;

    platform::pin_or_warn(cfg.core_offset(), "master");
    let mut sched = Scheduler::new(
        cfg.clone(),
        pool.clone(),
        fabric.clone(),
        mac_core,
        run.clone(),
    );
    let report = sched.run()?;

    // Clean shutdown: every pinned thread joins, queues are left drained.
    run.stop();
    streamer.stop();
    if let Some(workers) = workers {
        workers.join();
    }
    if let Some(mac) = mac_thread {
        let _ = mac.join();
    }

    if cfg.raw().dump_tx_data {
        pool.dump_tx(Path::new("tx_data.bin"), cfg.bs_ant_num())
            .context("dump tx_data.bin")?;
    }
    if cfg.raw().dump_decode_data {
        pool.dump_decoded(Path::new("decode_data.bin"), cfg.ue_num())
            .context("dump decode_data.bin")?;
    }

    info!(
        target: "runtime",
        frames = report.frames_retired,
        stalled = report.stalled,
        avg_frame_us = report.avg_frame.as_micros() as u64,
        avg_uplink_us = report.avg_uplink.as_micros() as u64,
        avg_downlink_us = report.avg_downlink.as_micros() as u64,
        fallback_allocs = FABRIC_FALLBACK_ALLOCS.load(Ordering::Relaxed),
        parity_flips = FABRIC_PARITY_FLIPS.load(Ordering::Relaxed),
        mac_send_failures = MAC_SEND_FAILURES.load(Ordering::Relaxed),
        "shutdown"
    );
    Ok(report)
}

fn load_config(args: &Args) -> Result<Config> {
    let path = args.config.clone().unwrap_or_else(core_config::discover);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut file: ConfigFile =
        serde_json::from_str(&content).with_context(|| format!("parse {}", path.display()))?;
    if let Some(frames) = args.frames {
        file.frames_to_test = frames;
    }
    if let Some(workers) = args.workers {
        file.worker_thread_num = workers;
    }
    if let Some(dir) = &args.log_dir {
        file.log_dir = Some(dir.clone());
    }
    Ok(Config::from_parts(file)?)
}

fn configure_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pylon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Log panics before the default hook aborts the process; a panic on any
/// pinned thread is a programming error, never a recoverable condition.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(target: "runtime", panic = %info, "thread panic");
        default_hook(info);
    }));
}
