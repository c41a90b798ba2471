//! Measurement task sets.
//!
//! Sessions rotate through four sets: upload and download at 10 kbit/s,
//! then upload and download at 20 kbit/s. Each set warms the path up with
//! a short synthetic trace, then runs a 30 s RTP trace and a 30 s
//! synthetic trace of the same rate.

use std::collections::BTreeSet;

use crate::replay::ReplayKind;
use crate::replay::ReplayKind::{RandomRecv, RandomSend, RtpRecv, RtpSend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementTask {
    pub kind: ReplayKind,
    /// File name under the configured traces directory.
    pub trace_file: &'static str,
}

impl MeasurementTask {
    pub const fn new(kind: ReplayKind, trace_file: &'static str) -> Self {
        Self { kind, trace_file }
    }
}

const UPLOAD_10: [MeasurementTask; 3] = [
    MeasurementTask::new(RandomSend, "warm_up.trace"),
    MeasurementTask::new(RtpSend, "rtp_30s_10Kbps_20ms.trace"),
    MeasurementTask::new(RandomSend, "random_30s_10Kbps_20ms.trace"),
];

const DOWNLOAD_10: [MeasurementTask; 3] = [
    MeasurementTask::new(RandomRecv, "warm_up.trace"),
    MeasurementTask::new(RtpRecv, "rtp_30s_10Kbps_20ms.trace"),
    MeasurementTask::new(RandomRecv, "random_30s_10Kbps_20ms.trace"),
];

const UPLOAD_20: [MeasurementTask; 3] = [
    MeasurementTask::new(RandomSend, "warm_up.trace"),
    MeasurementTask::new(RtpSend, "rtp_30s_20Kbps_20ms.trace"),
    MeasurementTask::new(RandomSend, "random_30s_20Kbps_20ms.trace"),
];

const DOWNLOAD_20: [MeasurementTask; 3] = [
    MeasurementTask::new(RandomRecv, "warm_up.trace"),
    MeasurementTask::new(RtpRecv, "rtp_30s_20Kbps_20ms.trace"),
    MeasurementTask::new(RandomRecv, "random_30s_20Kbps_20ms.trace"),
];

pub const TASK_SETS: [&[MeasurementTask]; 4] = [&UPLOAD_10, &DOWNLOAD_10, &UPLOAD_20, &DOWNLOAD_20];

/// Task set for the given rotation index.
pub fn task_set(index: u64) -> &'static [MeasurementTask] {
    TASK_SETS[(index % TASK_SETS.len() as u64) as usize]
}

/// Every trace file any task set needs.
pub fn required_trace_files() -> BTreeSet<&'static str> {
    TASK_SETS
        .iter()
        .flat_map(|set| set.iter().map(|t| t.trace_file))
        .collect()
}
