//! # Configuration
//!
//! TOML, read in two stages: a permissive `*Input` layer where every field
//! is optional, then [`VoiperfConfigInput::resolve`] which fills defaults
//! and validates.
//!
//! ```toml
//! version = 1
//!
//! [server]
//! address = "151.100.179.250"
//! port = 12345
//! connect_timeout_ms = 60000
//!
//! [scheduler]
//! profile = 2
//! battery_threshold = 5
//! start_on_boot = true
//!
//! [replay]
//! read_timeout_ms = 3000
//! hole_punch_count = 3
//!
//! [paths]
//! traces_dir = "/var/lib/voiperf/traces"
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::profile::SchedulerProfile;
use crate::scheduler::SchedulerKind;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Input layer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VoiperfConfigInput {
    pub version: u32,
    pub server: ServerConfigInput,
    pub scheduler: SchedulerConfigInput,
    pub replay: ReplayConfigInput,
    pub logging: LoggingConfigInput,
    pub paths: PathsConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfigInput {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigInput {
    pub kind: Option<SchedulerKind>,
    pub profile: Option<i64>,
    pub battery_threshold: Option<i64>,
    pub start_on_boot: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayConfigInput {
    pub first_packet_wait_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub join_margin_ms: Option<u64>,
    pub max_packet_size: Option<usize>,
    pub socket_buffer_size: Option<usize>,
    pub hole_punch_count: Option<u32>,
    pub hole_punch_interval_ms: Option<u64>,
    pub spin_threshold_us: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfigInput {
    pub rotate_size_bytes: Option<u64>,
    pub rotate_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfigInput {
    pub traces_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub results_file: Option<PathBuf>,
}

// ─── Resolved configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Read timeout on the control connection.
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "151.100.179.250".into(),
            port: 12345,
            connect_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(120),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        (self.address.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}:{}", self.address, self.port),
                )
            })
    }
}

/// Scheduler settings as configured. Range checks happen when the
/// scheduler starts or reloads, see [`crate::scheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub kind: SchedulerKind,
    pub profile_index: i64,
    pub battery_threshold: i64,
    pub start_on_boot: bool,
}

impl SchedulerSettings {
    pub const DEFAULT_BATTERY_THRESHOLD: i64 = 5;
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::FixedRepeat,
            profile_index: SchedulerProfile::DEFAULT_INDEX,
            battery_threshold: Self::DEFAULT_BATTERY_THRESHOLD,
            start_on_boot: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Receiver timeout before the first trace packet arrives.
    pub first_packet_wait: Duration,
    /// Steady-state socket read timeout; silence this long ends a replay.
    pub read_timeout: Duration,
    /// Added to the trace duration to get the join deadline.
    pub join_margin: Duration,
    pub max_packet_size: usize,
    pub socket_buffer_size: usize,
    pub hole_punch_count: u32,
    pub hole_punch_interval: Duration,
    /// Pacer busy-waits for the last part of each gap shorter than this.
    pub spin_threshold: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            first_packet_wait: Duration::from_secs(10),
            read_timeout: Duration::from_secs(3),
            join_margin: Duration::from_secs(10),
            max_packet_size: 1500,
            socket_buffer_size: 1024 * 1024,
            hole_punch_count: 3,
            hole_punch_interval: Duration::from_millis(100),
            spin_threshold: Duration::from_micros(1500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub rotate_size_bytes: u64,
    pub rotate_interval: Duration,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            rotate_size_bytes: 1024 * 1024,
            rotate_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsConfig {
    pub traces_dir: PathBuf,
    pub state_file: PathBuf,
    pub results_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            traces_dir: PathBuf::from("traces"),
            state_file: PathBuf::from("voiperf-state.json"),
            results_file: PathBuf::from("voiperf-results.jsonl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiperfConfig {
    pub version: u32,
    pub server: ServerConfig,
    pub scheduler: SchedulerSettings,
    pub replay: ReplayConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

impl Default for VoiperfConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            server: ServerConfig::default(),
            scheduler: SchedulerSettings::default(),
            replay: ReplayConfig::default(),
            logging: LoggingConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn non_zero(field: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

impl VoiperfConfigInput {
    pub fn resolve(self) -> Result<VoiperfConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let server_defaults = ServerConfig::default();
        let address = self
            .server
            .address
            .map(|a| a.trim().to_string())
            .unwrap_or(server_defaults.address);
        if address.is_empty() {
            return Err(ConfigError::Invalid {
                field: "server.address",
                reason: "must not be empty".into(),
            });
        }
        let server = ServerConfig {
            address,
            port: self.server.port.unwrap_or(server_defaults.port),
            connect_timeout: non_zero(
                "server.connect_timeout_ms",
                ms_or(self.server.connect_timeout_ms, server_defaults.connect_timeout),
            )?,
            read_timeout: non_zero(
                "server.read_timeout_ms",
                ms_or(self.server.read_timeout_ms, server_defaults.read_timeout),
            )?,
        };

        let sched_defaults = SchedulerSettings::default();
        let scheduler = SchedulerSettings {
            kind: self.scheduler.kind.unwrap_or(sched_defaults.kind),
            profile_index: self.scheduler.profile.unwrap_or(sched_defaults.profile_index),
            battery_threshold: self
                .scheduler
                .battery_threshold
                .unwrap_or(sched_defaults.battery_threshold),
            start_on_boot: self.scheduler.start_on_boot.unwrap_or(sched_defaults.start_on_boot),
        };

        let rd = ReplayConfig::default();
        let replay = ReplayConfig {
            first_packet_wait: non_zero(
                "replay.first_packet_wait_ms",
                ms_or(self.replay.first_packet_wait_ms, rd.first_packet_wait),
            )?,
            read_timeout: non_zero(
                "replay.read_timeout_ms",
                ms_or(self.replay.read_timeout_ms, rd.read_timeout),
            )?,
            join_margin: ms_or(self.replay.join_margin_ms, rd.join_margin),
            // Room for at least a footer or an RTP header.
            max_packet_size: self.replay.max_packet_size.unwrap_or(rd.max_packet_size).max(64),
            socket_buffer_size: self
                .replay
                .socket_buffer_size
                .unwrap_or(rd.socket_buffer_size),
            hole_punch_count: self.replay.hole_punch_count.unwrap_or(rd.hole_punch_count),
            hole_punch_interval: ms_or(self.replay.hole_punch_interval_ms, rd.hole_punch_interval),
            spin_threshold: self
                .replay
                .spin_threshold_us
                .map(Duration::from_micros)
                .unwrap_or(rd.spin_threshold),
        };

        let ld = LoggingConfig::default();
        let logging = LoggingConfig {
            rotate_size_bytes: self.logging.rotate_size_bytes.unwrap_or(ld.rotate_size_bytes),
            rotate_interval: self
                .logging
                .rotate_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(ld.rotate_interval),
        };

        let pd = PathsConfig::default();
        let paths = PathsConfig {
            traces_dir: self.paths.traces_dir.unwrap_or(pd.traces_dir),
            state_file: self.paths.state_file.unwrap_or(pd.state_file),
            results_file: self.paths.results_file.unwrap_or(pd.results_file),
        };

        Ok(VoiperfConfig {
            version,
            server,
            scheduler,
            replay,
            logging,
            paths,
        })
    }
}

impl VoiperfConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(VoiperfConfig::default());
        }
        let parsed: VoiperfConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn trace_path(&self, file_name: &str) -> PathBuf {
        self.paths.traces_dir.join(file_name)
    }
}
