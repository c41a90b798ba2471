//! # Trace Replay
//!
//! One UDP socket per measurement task. A *send* task paces the trace out
//! to the server and times the echoed replies; a *receive* task punches a
//! hole through the local NAT, then echoes a short reply for every trace
//! packet the server pushes to it.
//!
//! The four roles differ only in how they stamp, decode and answer packets,
//! which lives in [`hooks`]; the timing loops in [`engine`] are shared.
//!
//! Receive timeouts are the normal end of a replay and are reported as
//! [`RecvOutcome::Timeout`], never as errors.

pub mod engine;
pub mod hooks;
pub mod pacing;

use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use voiperf_trace::{RtpTrace, Trace};

use crate::config::ReplayConfig;
use crate::error::MeasurementError;

pub use engine::{run_receiver, run_sender, ReplayReport};
pub use hooks::{RandomRecvHooks, RandomSendHooks, ReplayHooks, ReplayTelemetry, RtpRecvHooks, RtpSendHooks};
pub use pacing::Pacer;

/// Payload of the datagrams a receiver sends before the exchange.
pub const HOLE_PUNCH_MESSAGE: &[u8] = b"I HATE NAT";

/// Payload that ends a trace.
pub const END_OF_TRACE_MESSAGE: &[u8] = b"QUIT";

// ─── Roles ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("Up"),
            Direction::Down => f.write_str("Down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplayKind {
    /// Send an RTP trace, time replies by RTP sequence number.
    RtpSend,
    /// Send a raw trace with a sequence/timestamp footer.
    RandomSend,
    /// Receive an RTP trace, echo each RTP header.
    RtpRecv,
    /// Receive a raw trace, echo each footer.
    RandomRecv,
}

impl ReplayKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            ReplayKind::RtpSend => "RTP_SEND",
            ReplayKind::RandomSend => "RANDOM_SEND",
            ReplayKind::RtpRecv => "RTP_RECV",
            ReplayKind::RandomRecv => "RANDOM_RECV",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "RTP_SEND" => Some(ReplayKind::RtpSend),
            "RANDOM_SEND" => Some(ReplayKind::RandomSend),
            "RTP_RECV" => Some(ReplayKind::RtpRecv),
            "RANDOM_RECV" => Some(ReplayKind::RandomRecv),
            _ => None,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            ReplayKind::RtpSend | ReplayKind::RandomSend => Direction::Up,
            ReplayKind::RtpRecv | ReplayKind::RandomRecv => Direction::Down,
        }
    }

    pub fn needs_rtp_trace(self) -> bool {
        matches!(self, ReplayKind::RtpSend | ReplayKind::RtpRecv)
    }
}

impl fmt::Display for ReplayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

// ─── Timestamp tables ────────────────────────────────────────────────────────

/// Fixed-size table of millisecond timestamps, one slot per packet.
///
/// Each slot is written by a single thread. [`record_first`] keeps the
/// first value written, so duplicated replies never overwrite the
/// original arrival time.
///
/// [`record_first`]: TimestampTable::record_first
#[derive(Debug)]
pub struct TimestampTable {
    slots: Box<[AtomicI64]>,
}

impl TimestampTable {
    pub const EMPTY: i64 = -1;

    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicI64::new(Self::EMPTY)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store `ts` if the slot is still empty. Returns whether it was stored.
    pub fn record_first(&self, index: usize, ts: i64) -> bool {
        match self.slots.get(index) {
            Some(slot) => slot
                .compare_exchange(Self::EMPTY, ts, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            None => false,
        }
    }

    /// Unconditional store. Returns `false` if `index` is out of range.
    pub fn set(&self, index: usize, ts: i64) -> bool {
        match self.slots.get(index) {
            Some(slot) => {
                slot.store(ts, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        self.slots
            .get(index)
            .map(|s| s.load(Ordering::Acquire))
            .filter(|&ts| ts != Self::EMPTY)
    }

    pub fn snapshot(&self) -> Vec<i64> {
        self.slots.iter().map(|s| s.load(Ordering::Acquire)).collect()
    }
}

// ─── Socket helpers ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    Datagram(usize),
    Timeout,
}

/// Receive one datagram, mapping the socket read timeout to
/// [`RecvOutcome::Timeout`].
pub fn recv_or_timeout(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<RecvOutcome> {
    loop {
        match socket.recv(buf) {
            Ok(n) => return Ok(RecvOutcome::Datagram(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(RecvOutcome::Timeout)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Bind an ephemeral UDP socket connected to `dest`, with enlarged kernel
/// buffers. Buffer sizing failures only warn.
pub fn open_socket(dest: SocketAddr, cfg: &ReplayConfig) -> io::Result<UdpSocket> {
    let bind: SocketAddr = if dest.is_ipv4() {
        "0.0.0.0:0".parse().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
    } else {
        "[::]:0".parse().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(dest)?;

    let sock = socket2::SockRef::from(&socket);
    if let Err(e) = sock.set_send_buffer_size(cfg.socket_buffer_size) {
        tracing::warn!(error = %e, "failed to set UDP send buffer size");
    }
    if let Err(e) = sock.set_recv_buffer_size(cfg.socket_buffer_size) {
        tracing::warn!(error = %e, "failed to set UDP receive buffer size");
    }
    tracing::debug!(
        send_buffer = sock.send_buffer_size().unwrap_or(0),
        recv_buffer = sock.recv_buffer_size().unwrap_or(0),
        "replay socket buffers"
    );
    Ok(socket)
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Task entry point ────────────────────────────────────────────────────────

/// What one replay task produced, before the server's verdict.
#[derive(Debug, Clone)]
pub struct ReplayOutput {
    pub report: ReplayReport,
    pub telemetry: ReplayTelemetry,
}

fn require_rtp(kind: ReplayKind, trace: &Trace) -> Result<&RtpTrace, MeasurementError> {
    trace.as_rtp().ok_or(MeasurementError::WrongTraceVersion {
        kind: kind.wire_name(),
        version: trace.version(),
    })
}

/// Replay `trace` against `dest` in the role given by `kind`.
pub fn replay_trace(
    kind: ReplayKind,
    trace: Arc<Trace>,
    dest: SocketAddr,
    cfg: &ReplayConfig,
) -> Result<ReplayOutput, MeasurementError> {
    if kind.needs_rtp_trace() {
        require_rtp(kind, &trace)?;
    }
    tracing::info!(
        task = %kind,
        trace_id = trace.id(),
        packets = trace.len(),
        duration_ms = trace.duration_millis(),
        %dest,
        "starting replay"
    );
    let socket = open_socket(dest, cfg)?;
    let duration_ms = trace.duration_millis();

    let (report, telemetry) = match kind {
        ReplayKind::RtpSend => {
            let hooks = Arc::new(RtpSendHooks::new(require_rtp(kind, &trace)?));
            let report = run_sender(socket, trace.clone(), hooks.clone(), cfg)?;
            (report, hooks.telemetry())
        }
        ReplayKind::RtpRecv => {
            let hooks = Arc::new(RtpRecvHooks::new(require_rtp(kind, &trace)?.sequence_range()));
            let report = run_receiver(socket, duration_ms, hooks.clone(), cfg)?;
            (report, hooks.telemetry())
        }
        ReplayKind::RandomSend => {
            let hooks = Arc::new(RandomSendHooks::new(trace.len(), cfg.max_packet_size));
            let report = run_sender(socket, trace.clone(), hooks.clone(), cfg)?;
            (report, hooks.telemetry())
        }
        ReplayKind::RandomRecv => {
            let hooks = Arc::new(RandomRecvHooks::new(trace.len()));
            let report = run_receiver(socket, duration_ms, hooks.clone(), cfg)?;
            (report, hooks.telemetry())
        }
    };

    tracing::info!(
        task = %kind,
        sent = report.packets_sent,
        received = report.datagrams_received,
        "replay finished"
    );
    Ok(ReplayOutput { report, telemetry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kind_wire_names_roundtrip() {
        for kind in [
            ReplayKind::RtpSend,
            ReplayKind::RandomSend,
            ReplayKind::RtpRecv,
            ReplayKind::RandomRecv,
        ] {
            assert_eq!(ReplayKind::from_wire_name(kind.wire_name()), Some(kind));
        }
        assert_eq!(ReplayKind::from_wire_name("PING"), None);
        assert_eq!(ReplayKind::RandomSend.direction(), Direction::Up);
        assert_eq!(ReplayKind::RtpRecv.direction(), Direction::Down);
    }

    #[test]
    fn table_keeps_first_write() {
        let table = TimestampTable::new(3);
        assert!(table.record_first(1, 100));
        assert!(!table.record_first(1, 200));
        assert_eq!(table.get(1), Some(100));
        assert_eq!(table.get(0), None);
        assert!(!table.record_first(3, 1));
        assert_eq!(table.snapshot(), vec![-1, 100, -1]);
    }

    #[test]
    fn table_first_write_wins_across_threads() {
        let table = Arc::new(TimestampTable::new(64));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..64).filter(|&i| table.record_first(i, t)).count()
                })
            })
            .collect();
        let stored: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(stored, 64);
        assert!(table.snapshot().iter().all(|&ts| (0..4).contains(&ts)));
    }

    #[test]
    fn recv_timeout_is_not_an_error() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.connect(socket.local_addr().unwrap()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(recv_or_timeout(&socket, &mut buf).unwrap(), RecvOutcome::Timeout);

        socket.send(b"hi").unwrap();
        assert_eq!(
            recv_or_timeout(&socket, &mut buf).unwrap(),
            RecvOutcome::Datagram(2)
        );
    }

    #[test]
    fn rtp_role_rejects_raw_trace() {
        let trace = Arc::new(Trace::V1(voiperf_trace::TraceV1::new(1, 0)));
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = replay_trace(ReplayKind::RtpSend, trace, dest, &ReplayConfig::default()).unwrap_err();
        assert!(matches!(err, MeasurementError::WrongTraceVersion { version: 1, .. }));
    }
}
