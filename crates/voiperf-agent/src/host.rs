//! Host-side collaborators for the measurement engine on Linux.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde_json::{json, Value};
use voiperf_core::context::{DeviceInfo, MeasurementResult, ResultStore};
use voiperf_core::scheduler::Battery;

// ─── Battery ─────────────────────────────────────────────────────────────────

/// Battery level from sysfs. Hosts without a battery report 100%.
#[derive(Debug, Clone)]
pub struct SysBattery {
    root: PathBuf,
}

impl Default for SysBattery {
    fn default() -> Self {
        Self::new("/sys/class/power_supply")
    }
}

impl SysBattery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Battery for SysBattery {
    fn percentage(&self) -> f64 {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(_) => return 100.0,
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            let kind = std::fs::read_to_string(dir.join("type")).unwrap_or_default();
            if kind.trim() != "Battery" {
                continue;
            }
            if let Some(level) = std::fs::read_to_string(dir.join("capacity"))
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
            {
                return level.clamp(0.0, 100.0);
            }
        }
        100.0
    }
}

// ─── Device info ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostDeviceInfo {
    pub unique_id: String,
    pub hostname: String,
}

impl HostDeviceInfo {
    pub fn detect() -> Self {
        let hostname = read_trimmed("/etc/hostname").unwrap_or_else(|| "voiperf-agent".into());
        let unique_id = read_trimmed("/etc/machine-id").unwrap_or_else(|| hostname.clone());
        Self { unique_id, hostname }
    }
}

fn read_trimmed(path: impl AsRef<Path>) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl DeviceInfo for HostDeviceInfo {
    fn device_info(&self) -> Value {
        json!({
            "unique_id": self.unique_id,
            "hostname": self.hostname,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "agent_version": env!("CARGO_PKG_VERSION"),
        })
    }

    fn network_status(&self) -> Value {
        json!({ "interfaces": scan_interfaces(Path::new("/sys/class/net")) })
    }
}

/// Interface names and operstate, loopback excluded.
fn scan_interfaces(root: &Path) -> Vec<Value> {
    let Ok(dir) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut interfaces: Vec<Value> = dir
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "lo" {
                return None;
            }
            let state = read_trimmed(entry.path().join("operstate")).unwrap_or_else(|| "unknown".into());
            Some(json!({ "name": name, "state": state }))
        })
        .collect();
    interfaces.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    interfaces
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// Appends each result as one JSON line.
#[derive(Debug)]
pub struct JsonlResultStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl ResultStore for JsonlResultStore {
    fn insert(&self, result: &MeasurementResult) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(result)?;
        line.push('\n');
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(())
    }
}
