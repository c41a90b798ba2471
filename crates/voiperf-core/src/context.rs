//! # Session Context
//!
//! Host services a measurement session uses but does not own. The agent
//! binary supplies real implementations; the null versions here keep a
//! session runnable (and testable) without them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::VoiperfConfig;
use crate::replay::Direction;

// ─── Collaborators ───────────────────────────────────────────────────────────

/// Static and slowly-changing facts about the device, sent to the server
/// once per session.
pub trait DeviceInfo: Send + Sync {
    /// Must contain a string `unique_id`.
    fn device_info(&self) -> Value;

    fn phone_status(&self) -> Value {
        Value::Null
    }

    fn network_status(&self) -> Value {
        Value::Null
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingRequest {
    pub destination: String,
    pub count: Option<u32>,
    pub interval: Option<Duration>,
    pub packet_size: Option<u32>,
    /// Whole seconds, as taken by `ping -w`.
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingReport {
    pub packets_received: u32,
    /// Full parsed output, forwarded to the server untouched.
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TracerouteReport {
    /// Hop addresses, nearest first.
    pub hops: Vec<String>,
    pub raw: Value,
}

/// ICMP tooling. `None` means the probe could not run at all.
pub trait NetworkProbe: Send + Sync {
    fn traceroute(&self, destination: &str) -> Option<TracerouteReport>;
    fn ping(&self, request: &PingRequest) -> Option<PingReport>;
}

/// Samples network status for the duration of a session.
pub trait StatusRecorder: Send + Sync {
    fn start(&self);
    fn stop(&self);
    /// Samples collected since the last `start`, if any.
    fn samples(&self) -> Option<Value>;
}

/// Keeps the host awake while a session runs.
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

pub trait ResultStore: Send + Sync {
    fn insert(&self, result: &MeasurementResult) -> anyhow::Result<()>;
}

/// Holds a [`WakeLock`] until dropped.
pub struct WakeGuard {
    lock: Arc<dyn WakeLock>,
}

impl WakeGuard {
    pub fn acquire(lock: Arc<dyn WakeLock>) -> Self {
        lock.acquire();
        Self { lock }
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// One task's outcome as kept on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub direction: Direction,
    /// kbit/s, truncated.
    pub rate: f64,
    /// Percent, truncated.
    pub packet_loss: f64,
    pub average_jitter: f64,
    pub mos: f64,
}

#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: Mutex<Vec<MeasurementResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<MeasurementResult> {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ResultStore for MemoryResultStore {
    fn insert(&self, result: &MeasurementResult) -> anyhow::Result<()> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        Ok(())
    }
}

// ─── Null collaborators ──────────────────────────────────────────────────────

/// Device info carrying only an identifier.
#[derive(Debug, Clone)]
pub struct StaticDeviceInfo {
    pub unique_id: String,
}

impl DeviceInfo for StaticDeviceInfo {
    fn device_info(&self) -> Value {
        json!({ "unique_id": self.unique_id })
    }
}

/// Probe that never has traceroute or ping available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProbe;

impl NetworkProbe for NullProbe {
    fn traceroute(&self, _destination: &str) -> Option<TracerouteReport> {
        None
    }

    fn ping(&self, _request: &PingRequest) -> Option<PingReport> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl StatusRecorder for NullRecorder {
    fn start(&self) {}
    fn stop(&self) {}
    fn samples(&self) -> Option<Value> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullWakeLock;

impl WakeLock for NullWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// Everything a [`MeasurementSession`](crate::session::MeasurementSession)
/// needs from its surroundings.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<VoiperfConfig>,
    pub device: Arc<dyn DeviceInfo>,
    pub probe: Arc<dyn NetworkProbe>,
    pub recorder: Arc<dyn StatusRecorder>,
    pub wake_lock: Arc<dyn WakeLock>,
    pub results: Arc<dyn ResultStore>,
}

impl SessionContext {
    /// Context with null collaborators and an in-memory result store.
    pub fn new(config: VoiperfConfig, device: Arc<dyn DeviceInfo>) -> Self {
        Self {
            config: Arc::new(config),
            device,
            probe: Arc::new(NullProbe),
            recorder: Arc::new(NullRecorder),
            wake_lock: Arc::new(NullWakeLock),
            results: Arc::new(MemoryResultStore::new()),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn StatusRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_wake_lock(mut self, wake_lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = wake_lock;
        self
    }

    pub fn with_results(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = results;
        self
    }

    /// User-facing settings, reported to the server with the client info.
    pub fn preferences(&self) -> Value {
        let s = &self.config.scheduler;
        json!({
            "scheduler_type": s.kind.name(),
            "profile": s.profile_index,
            "battery_threshold": s.battery_threshold,
            "start_on_boot": s.start_on_boot,
            "log_rotate_size": self.config.logging.rotate_size_bytes,
            "log_rotate_interval_secs": self.config.logging.rotate_interval.as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLock {
        held: AtomicUsize,
        released: AtomicUsize,
    }

    impl WakeLock for CountingLock {
        fn acquire(&self) {
            self.held.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self) {
            self.held.fetch_sub(1, Ordering::SeqCst);
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wake_guard_releases_once_on_drop() {
        let lock = Arc::new(CountingLock::default());
        {
            let _guard = WakeGuard::acquire(lock.clone());
            assert_eq!(lock.held.load(Ordering::SeqCst), 1);
        }
        assert_eq!(lock.held.load(Ordering::SeqCst), 0);
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wake_guard_releases_on_unwind() {
        let lock = Arc::new(CountingLock::default());
        let l = lock.clone();
        let r = std::panic::catch_unwind(move || {
            let _guard = WakeGuard::acquire(l);
            panic!("boom");
        });
        assert!(r.is_err());
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn result_serializes_with_type_label() {
        let r = MeasurementResult {
            timestamp: 1_700_000_000,
            direction: Direction::Up,
            rate: 10.0,
            packet_loss: 2.0,
            average_jitter: 0.0,
            mos: 0.0,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["type"], "Up");
        assert_eq!(v["packet_loss"], 2.0);
    }

    #[test]
    fn preferences_reflect_config() {
        let ctx = SessionContext::new(
            VoiperfConfig::default(),
            Arc::new(StaticDeviceInfo { unique_id: "abc".into() }),
        );
        let prefs = ctx.preferences();
        assert_eq!(prefs["profile"], 2);
        assert_eq!(prefs["battery_threshold"], 5);
        assert_eq!(ctx.device.device_info()["unique_id"], "abc");
    }
}
