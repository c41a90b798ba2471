use std::io;
use std::time::Duration;

use voiperf_trace::TraceError;

/// Anything that aborts a replay task or a session.
///
/// Receive timeouts never show up here; they are reported as
/// [`RecvOutcome::Timeout`](crate::replay::RecvOutcome::Timeout).
#[derive(Debug, thiserror::Error)]
pub enum MeasurementError {
    #[error("trace format: {0}")]
    TraceFormat(#[from] TraceError),
    #[error("socket: {0}")]
    Socket(#[from] io::Error),
    #[error("{kind} cannot replay a version {version} trace")]
    WrongTraceVersion { kind: &'static str, version: i32 },
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{what} did not finish within {limit:?}")]
    Deadline { what: &'static str, limit: Duration },
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

impl MeasurementError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Scheduler settings that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerConfigError {
    #[error("battery threshold must be between 0 and 100, got {0}")]
    BatteryThreshold(i64),
    #[error("invalid scheduler profile index {0}")]
    ProfileIndex(i64),
}
