//! # Measurement Session
//!
//! ```text
//! Idle → Connecting → Negotiating ─┬→ Busy
//!                                  ├→ Unavailable
//!                                  └→ Running → Completed | Failed
//! ```
//!
//! Whatever happens, a session ends by closing the control connection,
//! stopping the status recorder, reporting a [`SessionOutcome`] to its
//! listener, releasing the wake lock and storing the results it
//! collected, in that order.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use voiperf_trace::Trace;

use crate::context::{MeasurementResult, NetworkProbe, PingRequest, SessionContext, TracerouteReport, WakeGuard};
use crate::control::{trace_info_lines, Availability, ClientInfo, TaskTelemetry, TcpControlChannel, TraceStatistics};
use crate::error::MeasurementError;
use crate::replay::{self, Direction};
use crate::tasks::MeasurementTask;

/// Echo requests sent to each traceroute hop while looking for the first hop.
pub const DISCOVERY_PING_COUNT: u32 = 5;
/// Edge probe rate, packets per second.
pub const EDGE_PING_PER_SECOND: u32 = 2;
pub const EDGE_PING_PACKET_SIZE: u32 = 8;
/// Added to the trace duration to get the edge probe deadline.
pub const EDGE_PING_EXTRA_SECS: u64 = 2;

/// What the scheduler learns from a session. The flags are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub connected: bool,
    pub busy: bool,
    pub failed: bool,
}

impl SessionOutcome {
    pub const SUCCESS: SessionOutcome = SessionOutcome {
        connected: true,
        busy: false,
        failed: false,
    };
}

pub trait MeasurementListener: Send + Sync {
    fn measurement_finished(&self, outcome: SessionOutcome);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Negotiating,
    Busy,
    Unavailable,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn advance(state: &mut SessionState, to: SessionState) {
    tracing::debug!(from = %state, %to, "session state");
    *state = to;
}

// ─── First hop ───────────────────────────────────────────────────────────────

/// Traceroute towards `target`, then ping hops nearest first until one
/// answers.
pub fn discover_first_hop(probe: &dyn NetworkProbe, target: &str) -> (Option<TracerouteReport>, Option<String>) {
    let Some(report) = probe.traceroute(target) else {
        tracing::warn!(target, "traceroute unavailable");
        return (None, None);
    };
    let first_hop = report.hops.iter().find(|hop| {
        let request = PingRequest {
            destination: (*hop).clone(),
            count: Some(DISCOVERY_PING_COUNT),
            ..Default::default()
        };
        probe
            .ping(&request)
            .is_some_and(|r| r.packets_received > 0)
    });
    match first_hop {
        Some(hop) => tracing::info!(%hop, "first hop found"),
        None => tracing::warn!("failed to find the first hop"),
    }
    let first_hop = first_hop.cloned();
    (Some(report), first_hop)
}

/// Traceroute output as sent to the server, with the chosen hop added.
fn traceroute_json(report: &TracerouteReport, first_hop: Option<&str>) -> Value {
    let mut raw = report.raw.clone();
    if let Value::Object(map) = &mut raw {
        map.insert(
            "firsthop".into(),
            first_hop.map_or(Value::Null, |h| Value::String(h.to_string())),
        );
    }
    raw
}

/// Latency probe to the first hop, running alongside one task's exchange.
struct EdgeProbe {
    handle: JoinHandle<Option<Value>>,
}

impl EdgeProbe {
    fn spawn(probe: Arc<dyn NetworkProbe>, hop: &str, trace_duration_ms: i64) -> Option<Self> {
        let request = PingRequest {
            destination: hop.to_string(),
            count: None,
            interval: Some(Duration::from_secs(1) / EDGE_PING_PER_SECOND),
            packet_size: Some(EDGE_PING_PACKET_SIZE),
            deadline_secs: Some(u64::try_from(trace_duration_ms / 1000).unwrap_or(0) + EDGE_PING_EXTRA_SECS),
        };
        tracing::info!(hop, deadline_secs = ?request.deadline_secs, "starting first hop ping");
        let spawned = thread::Builder::new()
            .name("voiperf-edge-ping".into())
            .spawn(move || probe.ping(&request).map(|r| r.raw));
        match spawned {
            Ok(handle) => Some(Self { handle }),
            Err(e) => {
                tracing::warn!(error = %e, "failed to start first hop ping");
                None
            }
        }
    }

    fn join(self) -> Option<Value> {
        self.handle.join().unwrap_or_else(|_| {
            tracing::warn!("first hop ping thread panicked");
            None
        })
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub struct MeasurementSession {
    ctx: SessionContext,
    tasks: Vec<MeasurementTask>,
}

impl MeasurementSession {
    pub fn new(ctx: SessionContext, tasks: impl Into<Vec<MeasurementTask>>) -> Self {
        Self {
            ctx,
            tasks: tasks.into(),
        }
    }

    /// Run every task in order and report to `listener`.
    pub fn run(self, listener: &dyn MeasurementListener) -> SessionOutcome {
        let mut run = SessionRun::begin(&self.ctx, listener);
        if let Err(e) = run.execute(&self.tasks) {
            tracing::error!(error = %e, state = %run.state, "measurement failed");
            let failed_state = match run.state {
                SessionState::Unavailable => SessionState::Unavailable,
                _ => SessionState::Failed,
            };
            advance(&mut run.state, failed_state);
        }
        let outcome = run.outcome;
        drop(run);
        outcome
    }
}

/// State of a session in progress. Dropping it performs the end-of-session
/// steps exactly once.
struct SessionRun<'a> {
    ctx: &'a SessionContext,
    listener: &'a dyn MeasurementListener,
    state: SessionState,
    outcome: SessionOutcome,
    channel: Option<TcpControlChannel>,
    results: Vec<MeasurementResult>,
    wake: Option<WakeGuard>,
}

impl<'a> SessionRun<'a> {
    fn begin(ctx: &'a SessionContext, listener: &'a dyn MeasurementListener) -> Self {
        let wake = WakeGuard::acquire(ctx.wake_lock.clone());
        ctx.recorder.start();
        Self {
            ctx,
            listener,
            state: SessionState::Idle,
            outcome: SessionOutcome {
                connected: false,
                busy: false,
                failed: true,
            },
            channel: None,
            results: Vec::new(),
            wake: Some(wake),
        }
    }

    fn execute(&mut self, tasks: &[MeasurementTask]) -> Result<(), MeasurementError> {
        let ctx = self.ctx;
        advance(&mut self.state, SessionState::Connecting);
        let channel = self.channel.insert(TcpControlChannel::connect(&ctx.config.server)?);
        self.outcome.connected = true;

        advance(&mut self.state, SessionState::Negotiating);
        match channel.read_availability() {
            Ok(Availability::Available) => {
                tracing::info!("measurement server available, starting measurement");
            }
            Ok(Availability::Busy) => {
                tracing::info!("measurement server busy, retrying later");
                self.outcome.busy = true;
                advance(&mut self.state, SessionState::Busy);
                return Ok(());
            }
            Err(e) => {
                advance(&mut self.state, SessionState::Unavailable);
                return Err(e);
            }
        }

        let device_info = ctx.device.device_info();
        if !device_info.get("unique_id").is_some_and(Value::is_string) {
            return Err(MeasurementError::protocol("device info has no unique_id"));
        }
        channel.send_json_blob(&ClientInfo {
            device_info,
            phone_status: ctx.device.phone_status(),
            network_status: ctx.device.network_status(),
            client_local_address: channel.local_addr().map(Into::into),
            preferences: ctx.preferences(),
        })?;
        tracing::info!("client info sent");

        let target = channel
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| ctx.config.server.address.clone());
        let (traceroute, first_hop) = discover_first_hop(ctx.probe.as_ref(), &target);
        match &traceroute {
            Some(report) => channel.send_compressed_json(&traceroute_json(report, first_hop.as_deref()))?,
            None => channel.send_empty_blob()?,
        }

        advance(&mut self.state, SessionState::Running);
        for task in tasks {
            let result = run_task(ctx, channel, task, first_hop.as_deref())?;
            self.results.push(result);
        }

        ctx.recorder.stop();
        channel.finish(ctx.recorder.samples().as_ref())?;
        self.outcome.failed = false;
        advance(&mut self.state, SessionState::Completed);
        tracing::info!(tasks = tasks.len(), "measurement session completed");
        Ok(())
    }
}

impl Drop for SessionRun<'_> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.ctx.recorder.stop();
        self.listener.measurement_finished(self.outcome);
        drop(self.wake.take());
        for result in self.results.drain(..) {
            if let Err(e) = self.ctx.results.insert(&result) {
                tracing::error!(error = %e, "failed to store measurement result");
            }
        }
    }
}

fn run_task(
    ctx: &SessionContext,
    channel: &mut TcpControlChannel,
    task: &MeasurementTask,
    first_hop: Option<&str>,
) -> Result<MeasurementResult, MeasurementError> {
    let path: PathBuf = ctx.config.trace_path(task.trace_file);
    let trace = Arc::new(Trace::load(&path)?);
    let info = trace_info_lines(task.kind, &trace, &path);
    let endpoint = channel.begin_task(task.kind, &info)?;
    let dest = endpoint.resolve()?;

    let edge = first_hop.and_then(|hop| EdgeProbe::spawn(ctx.probe.clone(), hop, trace.duration_millis()));
    let replayed = replay::replay_trace(task.kind, trace, dest, &ctx.config.replay);
    let ping_rtts = edge.and_then(EdgeProbe::join);
    let output = replayed?;

    channel.send_compressed_json(&TaskTelemetry {
        local_address: output.report.local_addr.into(),
        replay: output.telemetry,
        ping_rtts,
    })?;
    let stats = channel.read_statistics()?;
    tracing::info!(
        task = %task.kind,
        trace = task.trace_file,
        packet_loss = stats.packet_loss,
        rate_kbits = stats.avg_rate_kbits,
        "task finished"
    );
    Ok(result_from_statistics(&stats, task.kind.direction()))
}

pub fn result_from_statistics(stats: &TraceStatistics, direction: Direction) -> MeasurementResult {
    MeasurementResult {
        timestamp: chrono::Utc::now().timestamp(),
        direction,
        rate: stats.rate_kbits(),
        packet_loss: stats.packet_loss_percent(),
        average_jitter: stats.average_jitter(),
        mos: stats.mos(),
    }
}

// ─── Launching ───────────────────────────────────────────────────────────────

/// Starts sessions off the caller's thread; implemented for the scheduler.
pub trait SessionLauncher: Send + Sync {
    fn launch(&self, task_index: u64, listener: Arc<dyn MeasurementListener>);
}

/// Runs each session on its own thread.
pub struct ThreadLauncher {
    ctx: SessionContext,
}

impl ThreadLauncher {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }
}

impl SessionLauncher for ThreadLauncher {
    fn launch(&self, task_index: u64, listener: Arc<dyn MeasurementListener>) {
        let tasks = crate::tasks::task_set(task_index);
        tracing::info!(task_index, set = task_index % crate::tasks::TASK_SETS.len() as u64, "running task set");
        let session = MeasurementSession::new(self.ctx.clone(), tasks);
        let listener_on_error = listener.clone();
        let spawned = thread::Builder::new()
            .name("voiperf-session".into())
            .spawn(move || {
                session.run(listener.as_ref());
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to start measurement session");
            listener_on_error.measurement_finished(SessionOutcome {
                connected: false,
                busy: false,
                failed: true,
            });
        }
    }
}
