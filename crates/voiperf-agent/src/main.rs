//! VoIPerf Agent
//!
//! Daemon that periodically measures VoIP call quality against a VoIPerf
//! server.
//!
//! - Schedules sessions by time-of-day profile, battery level and the
//!   outcome of the previous session
//! - Replays recorded voice traces over UDP in both directions
//! - Appends per-task loss and rate results to a JSON-lines file
//! - In `--once` mode, runs a single session immediately and exits

mod host;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use voiperf_core::config::VoiperfConfig;
use voiperf_core::context::SessionContext;
use voiperf_core::scheduler::{create_scheduler, FileStateStore, SchedulerDeps, StateStore, SystemClock, ThreadTimer};
use voiperf_core::session::{MeasurementListener, MeasurementSession, SessionOutcome, ThreadLauncher};
use voiperf_core::tasks;

/// VoIPerf measurement agent.
#[derive(Parser, Debug)]
#[command(name = "voiperf-agent", about = "VoIPerf VoIP quality measurement agent")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `voiperf_core=trace`. Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,

    /// Run one measurement session now and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Start the scheduler even when `start_on_boot` is disabled.
    #[arg(long, default_value_t = false)]
    force_start: bool,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

struct LogListener;

impl MeasurementListener for LogListener {
    fn measurement_finished(&self, outcome: SessionOutcome) {
        tracing::info!(
            connected = outcome.connected,
            busy = outcome.busy,
            failed = outcome.failed,
            "session finished"
        );
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = match &cli.config {
        Some(path) => VoiperfConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => VoiperfConfig::default(),
    };

    tracing::info!(
        server = %config.server.address,
        port = config.server.port,
        profile = config.scheduler.profile_index,
        traces = %config.paths.traces_dir.display(),
        "voiperf-agent starting"
    );
    tracing::info!(
        rotate_size_bytes = config.logging.rotate_size_bytes,
        rotate_interval_secs = config.logging.rotate_interval.as_secs(),
        "log rotation is left to the service manager"
    );
    for file in tasks::required_trace_files() {
        let path = config.trace_path(file);
        if !path.exists() {
            tracing::warn!(path = %path.display(), "trace file missing, tasks using it will fail");
        }
    }

    let store = Arc::new(FileStateStore::new(&config.paths.state_file));
    let ctx = SessionContext::new(config.clone(), Arc::new(host::HostDeviceInfo::detect()))
        .with_results(Arc::new(host::JsonlResultStore::new(&config.paths.results_file)));

    if cli.once {
        let mut state = store.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not read scheduler state, using the first task set");
            Default::default()
        });
        let outcome = MeasurementSession::new(ctx, tasks::task_set(state.task_index)).run(&LogListener);
        // The pending countdown is left as is; only the rotation moves on.
        let verdict = state.record_outcome(outcome);
        store
            .save(&state)
            .with_context(|| format!("saving {}", store.path().display()))?;
        tracing::info!(?verdict, next_task_index = state.task_index, "one-shot session done");
        anyhow::ensure!(!outcome.busy, "measurement server is busy");
        anyhow::ensure!(!outcome.failed, "measurement session failed");
        return Ok(());
    }

    if !config.scheduler.start_on_boot && !cli.force_start {
        tracing::info!("start_on_boot is disabled, not starting the scheduler (use --force-start)");
        return Ok(());
    }

    let clock = Arc::new(SystemClock);
    let timer = ThreadTimer::new(clock.clone()).context("starting timer thread")?;
    let scheduler = create_scheduler(
        config.scheduler.kind,
        config.scheduler.clone(),
        SchedulerDeps {
            clock,
            timer: Arc::new(timer),
            store,
            battery: Arc::new(host::SysBattery::default()),
            launcher: Arc::new(ThreadLauncher::new(ctx)),
        },
    );
    scheduler.start().context("starting scheduler")?;

    // ── Shutdown handling ───────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("installing signal handler")?;

    let _ = shutdown_rx.recv();
    tracing::info!(next_trigger_ms = ?scheduler.next_trigger_ms(), "received shutdown signal");
    scheduler.stop();
    tracing::info!("voiperf-agent stopped");
    Ok(())
}
