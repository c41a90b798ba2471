//! # voiperf-core
//!
//! Active VoIP-quality measurement engine.
//!
//! A session connects to the measurement server over TCP, then replays a
//! list of recorded traces over UDP (uploading or downloading), collecting
//! per-packet timestamps which the server turns into loss and rate
//! statistics. A scheduler decides when the next session runs.
//!
//! ## Crate structure
//!
//! - [`replay`] — Timed UDP sender/receiver loops and per-trace hooks
//! - [`control`] — TCP control-channel protocol
//! - [`session`] — One measurement session, start to finish
//! - [`tasks`] — The rotating sets of measurement tasks
//! - [`scheduler`] — When the next session runs
//! - [`profile`] — Time-of-day measurement frequency profiles
//! - [`context`] — Host collaborators a session depends on
//! - [`config`] — TOML configuration
//! - [`error`] — Error types

pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod profile;
pub mod replay;
pub mod scheduler;
pub mod session;
pub mod tasks;

pub use error::{MeasurementError, SchedulerConfigError};
