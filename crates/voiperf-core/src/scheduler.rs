//! # Scheduler
//!
//! Decides when the next measurement session runs.
//!
//! ```text
//!            start()                 timer fires
//! Stopped ──────────→ Running ──────────────────→ battery low? ─ yes → +15 min
//!    ↑                  │  ↑                          │ no
//!    └──── stop() ──────┘  └── measurement_finished ←─ launch session
//! ```
//!
//! Every computed trigger is persisted before the timer is armed, so a
//! restart or a stop/start cycle resumes the same countdown.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerSettings;
use crate::error::SchedulerConfigError;
use crate::profile::SchedulerProfile;
use crate::session::{MeasurementListener, SessionLauncher, SessionOutcome};

/// Delay after a session that could not connect or failed.
pub const FAILURE_RETRY: Duration = Duration::from_secs(900);
/// Delay after the server reported itself busy.
pub const BUSY_BACKOFF: Duration = Duration::from_secs(300);
/// Postponement when the battery is below the configured threshold.
pub const BATTERY_LOW_RETRY: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    #[default]
    #[serde(alias = "FixedRepeatScheduler")]
    FixedRepeat,
}

impl SchedulerKind {
    pub fn name(self) -> &'static str {
        match self {
            SchedulerKind::FixedRepeat => "FixedRepeatScheduler",
        }
    }
}

// ─── Collaborators ───────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    /// Wall clock, epoch milliseconds.
    fn now_ms(&self) -> i64;
    /// Local hour of day, 0-23.
    fn local_hour(&self) -> u32;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn local_hour(&self) -> u32 {
        use chrono::Timelike;
        chrono::Local::now().hour()
    }
}

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// One-shot wake timer. Arming replaces any pending callback.
pub trait Timer: Send + Sync {
    fn arm(&self, at_ms: i64, callback: TimerCallback);
    fn cancel(&self);
}

pub trait Battery: Send + Sync {
    /// Charge level, 0-100.
    fn percentage(&self) -> f64;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Epoch ms of the next session, if one was ever scheduled.
    pub next_trigger_ms: Option<i64>,
    /// Rotation index into the task sets.
    pub task_index: u64,
}

impl SchedulerState {
    /// Classify a finished session; a successful one moves the rotation
    /// on to the next task set.
    pub fn record_outcome(&mut self, outcome: SessionOutcome) -> Verdict {
        let verdict = Verdict::of(outcome);
        if verdict == Verdict::Success {
            self.task_index = self.task_index.wrapping_add(1);
        }
        verdict
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> anyhow::Result<SchedulerState>;
    fn save(&self, state: &SchedulerState) -> anyhow::Result<()>;
}

/// JSON state file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> anyhow::Result<SchedulerState> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SchedulerState::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    fn save(&self, state: &SchedulerState) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(state)?).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<SchedulerState>,
}

impl MemoryStateStore {
    pub fn new(state: SchedulerState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> anyhow::Result<SchedulerState> {
        Ok(self.state())
    }

    fn save(&self, state: &SchedulerState) -> anyhow::Result<()> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state.clone();
        Ok(())
    }
}

// ─── Thread timer ────────────────────────────────────────────────────────────

/// Longest single wait, so wall-clock jumps are noticed.
const TIMER_MAX_WAIT: Duration = Duration::from_secs(60);

enum TimerCommand {
    Arm(i64, TimerCallback),
    Cancel,
    Shutdown,
}

/// [`Timer`] backed by one worker thread. Callbacks run on that thread.
pub struct ThreadTimer {
    tx: Sender<TimerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadTimer {
    pub fn new(clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("voiperf-timer".into())
            .spawn(move || timer_loop(rx, clock.as_ref()))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }
}

fn timer_loop(rx: Receiver<TimerCommand>, clock: &dyn Clock) {
    let mut pending: Option<(i64, TimerCallback)> = None;
    loop {
        let command = match &pending {
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some((at_ms, _)) => {
                let wait = u64::try_from(*at_ms - clock.now_ms()).unwrap_or(0);
                rx.recv_timeout(Duration::from_millis(wait).min(TIMER_MAX_WAIT))
            }
        };
        match command {
            Ok(TimerCommand::Arm(at_ms, callback)) => pending = Some((at_ms, callback)),
            Ok(TimerCommand::Cancel) => pending = None,
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if pending.as_ref().is_some_and(|(at_ms, _)| clock.now_ms() >= *at_ms) {
                    if let Some((_, callback)) = pending.take() {
                        callback();
                    }
                }
            }
        }
    }
    tracing::debug!("timer thread exiting");
}

impl Timer for ThreadTimer {
    fn arm(&self, at_ms: i64, callback: TimerCallback) {
        if self.tx.send(TimerCommand::Arm(at_ms, callback)).is_err() {
            tracing::error!("timer thread is gone, trigger dropped");
        }
    }

    fn cancel(&self) {
        let _ = self.tx.send(TimerCommand::Cancel);
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            // A callback dropping the last scheduler handle runs on the timer thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// How a finished session is classified for rescheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Busy,
    Failed,
}

impl Verdict {
    /// A busy server counts as busy even though the session did not
    /// complete; any other incomplete or unconnected session is a failure.
    pub fn of(outcome: SessionOutcome) -> Self {
        if outcome.connected && outcome.busy {
            Verdict::Busy
        } else if !outcome.connected || outcome.failed {
            Verdict::Failed
        } else {
            Verdict::Success
        }
    }

    pub fn delay_ms(self, profile: SchedulerProfile, hour: u32) -> i64 {
        let delay = match self {
            Verdict::Success => Duration::from_millis(profile.interval_ms(hour)),
            Verdict::Busy => BUSY_BACKOFF,
            Verdict::Failed => FAILURE_RETRY,
        };
        duration_ms(delay)
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn validate_battery_threshold(threshold: i64) -> Result<f64, SchedulerConfigError> {
    if (0..=100).contains(&threshold) {
        Ok(threshold as f64)
    } else {
        Err(SchedulerConfigError::BatteryThreshold(threshold))
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

pub struct SchedulerDeps {
    pub clock: Arc<dyn Clock>,
    pub timer: Arc<dyn Timer>,
    pub store: Arc<dyn StateStore>,
    pub battery: Arc<dyn Battery>,
    pub launcher: Arc<dyn SessionLauncher>,
}

struct SchedulerCore {
    running: bool,
    settings: SchedulerSettings,
    profile: SchedulerProfile,
    persisted: SchedulerState,
}

struct Inner {
    deps: SchedulerDeps,
    core: Mutex<SchedulerCore>,
}

/// Repeats measurement sessions at profile-dependent intervals.
///
/// Cheap to clone; all clones drive the same schedule. Every state
/// transition happens under one lock.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

pub fn create_scheduler(kind: SchedulerKind, settings: SchedulerSettings, deps: SchedulerDeps) -> Scheduler {
    match kind {
        SchedulerKind::FixedRepeat => Scheduler::new(settings, deps),
    }
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, deps: SchedulerDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                core: Mutex::new(SchedulerCore {
                    running: false,
                    settings,
                    profile: SchedulerProfile::default(),
                    persisted: SchedulerState::default(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerCore> {
        self.inner.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(&self) -> Result<(), SchedulerConfigError> {
        let mut core = self.lock();
        if core.running {
            tracing::debug!("scheduler already running");
            return Ok(());
        }
        let profile = SchedulerProfile::from_index(core.settings.profile_index)?;
        validate_battery_threshold(core.settings.battery_threshold)?;

        core.persisted = match self.inner.deps.store.load() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "could not load scheduler state, starting fresh");
                SchedulerState::default()
            }
        };
        core.profile = profile;
        core.running = true;

        let clock = &self.inner.deps.clock;
        let trigger = match core.persisted.next_trigger_ms {
            Some(at_ms) if at_ms > 0 => {
                tracing::info!(at_ms, "resuming persisted countdown");
                at_ms
            }
            _ => clock.now_ms() + duration_ms(Duration::from_millis(profile.interval_ms(clock.local_hour()))),
        };
        tracing::info!(%profile, task_index = core.persisted.task_index, "scheduler started");
        self.schedule(&mut core, trigger);
        Ok(())
    }

    /// Cancel the pending trigger. The persisted trigger stays so a later
    /// [`start`](Self::start) resumes the countdown.
    pub fn stop(&self) {
        let mut core = self.lock();
        if !core.running {
            return;
        }
        core.running = false;
        self.inner.deps.timer.cancel();
        tracing::info!(next_trigger_ms = ?core.persisted.next_trigger_ms, "scheduler stopped");
    }

    /// Apply changed settings. A different profile restarts the countdown
    /// from now, or from the next [`start`](Self::start) when stopped; a
    /// new battery threshold applies at the next firing.
    pub fn reload(&self, settings: SchedulerSettings) -> Result<(), SchedulerConfigError> {
        let profile = SchedulerProfile::from_index(settings.profile_index)?;
        validate_battery_threshold(settings.battery_threshold)?;
        let mut core = self.lock();
        let previous = if core.running {
            Some(core.profile)
        } else {
            SchedulerProfile::from_index(core.settings.profile_index).ok()
        };
        core.settings = settings;
        if previous == Some(profile) {
            return Ok(());
        }
        core.profile = profile;
        if core.running {
            let clock = &self.inner.deps.clock;
            let trigger = clock.now_ms() + duration_ms(Duration::from_millis(profile.interval_ms(clock.local_hour())));
            tracing::info!(%profile, "profile changed, restarting countdown");
            self.schedule(&mut core, trigger);
            return Ok(());
        }
        // Stopped: drop the old profile's countdown so start() computes a fresh one.
        match self.inner.deps.store.load() {
            Ok(mut state) => {
                state.next_trigger_ms = None;
                if let Err(e) = self.inner.deps.store.save(&state) {
                    tracing::error!(error = %e, "failed to persist scheduler state");
                }
                core.persisted = state;
                tracing::info!(%profile, "profile changed while stopped, countdown reset");
            }
            Err(e) => tracing::warn!(error = %e, "could not load scheduler state"),
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn next_trigger_ms(&self) -> Option<i64> {
        self.lock().persisted.next_trigger_ms
    }

    pub fn task_index(&self) -> u64 {
        self.lock().persisted.task_index
    }

    pub fn profile(&self) -> SchedulerProfile {
        self.lock().profile
    }

    fn schedule(&self, core: &mut SchedulerCore, at_ms: i64) {
        core.persisted.next_trigger_ms = Some(at_ms);
        if let Err(e) = self.inner.deps.store.save(&core.persisted) {
            tracing::error!(error = %e, "failed to persist scheduler state");
        }
        let in_secs = (at_ms - self.inner.deps.clock.now_ms()) / 1000;
        tracing::info!(at_ms, in_secs, "next measurement scheduled");

        let weak = Arc::downgrade(&self.inner);
        self.inner.deps.timer.arm(
            at_ms,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Scheduler { inner }.fire();
                }
            }),
        );
    }

    /// Timer callback.
    pub fn fire(&self) {
        let task_index = {
            let mut core = self.lock();
            if !core.running {
                return;
            }
            let battery = self.inner.deps.battery.percentage();
            let threshold = core.settings.battery_threshold as f64;
            if battery < threshold {
                tracing::warn!(battery, threshold, "battery low, postponing measurement");
                let at_ms = self.inner.deps.clock.now_ms() + duration_ms(BATTERY_LOW_RETRY);
                self.schedule(&mut core, at_ms);
                return;
            }
            core.persisted.task_index
        };
        tracing::info!(task_index, "starting measurement session");
        self.inner
            .deps
            .launcher
            .launch(task_index, Arc::new(self.clone()));
    }
}

impl MeasurementListener for Scheduler {
    fn measurement_finished(&self, outcome: SessionOutcome) {
        let mut core = self.lock();
        if !core.running {
            tracing::info!(?outcome, "measurement finished while stopped");
            return;
        }
        let verdict = core.persisted.record_outcome(outcome);
        let clock = &self.inner.deps.clock;
        let at_ms = clock.now_ms() + verdict.delay_ms(core.profile, clock.local_hour());
        tracing::info!(?verdict, ?outcome, "measurement finished");
        self.schedule(&mut core, at_ms);
    }
}
