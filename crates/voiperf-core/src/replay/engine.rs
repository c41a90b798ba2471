//! Sender and receiver loops.
//!
//! Both roles run their blocking socket work on named worker threads and
//! the calling thread waits on a completion channel with a deadline of
//! trace duration plus [`ReplayConfig::join_margin`]. Every blocking
//! receive carries a socket timeout, so workers always terminate on
//! their own; a worker that misses the deadline is left to finish
//! detached and the task fails.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use voiperf_trace::Trace;

use super::pacing::Pacer;
use super::{recv_or_timeout, wall_clock_ms, RecvOutcome, ReplayHooks, END_OF_TRACE_MESSAGE, HOLE_PUNCH_MESSAGE};
use crate::config::ReplayConfig;
use crate::error::MeasurementError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    /// Local end of the replay socket, reported to the server.
    pub local_addr: SocketAddr,
    /// Trace packets sent (senders) or replies sent (receivers).
    pub packets_sent: usize,
    /// Replies received (senders) or trace packets received (receivers).
    pub datagrams_received: usize,
}

// ─── Workers ─────────────────────────────────────────────────────────────────

struct Worker<T> {
    name: &'static str,
    done: Receiver<Result<T, MeasurementError>>,
}

impl<T: Send + 'static> Worker<T> {
    fn spawn<F>(name: &'static str, f: F) -> Result<Self, MeasurementError>
    where
        F: FnOnce() -> Result<T, MeasurementError> + Send + 'static,
    {
        let (tx, done) = bounded(1);
        thread::Builder::new().name(name.into()).spawn(move || {
            let _ = tx.send(f());
        })?;
        Ok(Self { name, done })
    }

    /// Wait for the worker's result for at most `limit`.
    fn join_within(self, limit: Duration) -> Result<T, MeasurementError> {
        match self.done.recv_timeout(limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(worker = self.name, ?limit, "replay worker missed its deadline");
                Err(MeasurementError::Deadline {
                    what: self.name,
                    limit,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(MeasurementError::ThreadPanicked(self.name)),
        }
    }

    fn join(self) -> Result<T, MeasurementError> {
        self.done
            .recv()
            .map_err(|_| MeasurementError::ThreadPanicked(self.name))?
    }
}

fn join_deadline(duration_ms: i64, cfg: &ReplayConfig) -> Duration {
    Duration::from_millis(u64::try_from(duration_ms).unwrap_or(0)) + cfg.join_margin
}

// ─── Sender ──────────────────────────────────────────────────────────────────

/// Replay `trace` over the connected `socket` at its recorded timing, then
/// send the end-of-trace message. A second thread collects replies until
/// the socket stays silent for [`ReplayConfig::read_timeout`].
pub fn run_sender<H: ReplayHooks>(
    socket: UdpSocket,
    trace: Arc<Trace>,
    hooks: Arc<H>,
    cfg: &ReplayConfig,
) -> Result<ReplayReport, MeasurementError> {
    socket.set_read_timeout(Some(cfg.read_timeout))?;
    let local_addr = socket.local_addr()?;
    let reply_socket = socket.try_clone()?;
    let deadline = join_deadline(trace.duration_millis(), cfg);

    let send_hooks = hooks.clone();
    let spin = cfg.spin_threshold;
    let send_trace = trace.clone();
    let sender = Worker::spawn("voiperf-send", move || {
        send_packets(&socket, &send_trace, send_hooks.as_ref(), spin)
    })?;

    let max_packet = cfg.max_packet_size;
    let replies = Worker::spawn("voiperf-replies", move || {
        collect_replies(&reply_socket, hooks.as_ref(), max_packet)
    })?;

    let packets_sent = sender.join_within(deadline)?;
    let datagrams_received = replies.join()?;
    Ok(ReplayReport {
        local_addr,
        packets_sent,
        datagrams_received,
    })
}

fn send_packets<H: ReplayHooks + ?Sized>(
    socket: &UdpSocket,
    trace: &Trace,
    hooks: &H,
    spin_threshold: Duration,
) -> Result<usize, MeasurementError> {
    let mut pacer = Pacer::new(spin_threshold);
    let mut datagram = BytesMut::new();
    let mut sent = 0;
    for (index, packet) in trace.packets().iter().enumerate() {
        pacer.wait_until_due(packet.ts_millis);
        datagram.clear();
        if hooks.prepare_outbound_packet(index, packet, wall_clock_ms(), &mut datagram) {
            socket.send(&datagram)?;
            sent += 1;
        }
    }
    socket.send(END_OF_TRACE_MESSAGE)?;
    tracing::debug!(sent, "trace sent");
    Ok(sent)
}

fn collect_replies<H: ReplayHooks + ?Sized>(
    socket: &UdpSocket,
    hooks: &H,
    max_packet: usize,
) -> Result<usize, MeasurementError> {
    let mut buf = vec![0u8; max_packet];
    let mut received = 0;
    loop {
        match recv_or_timeout(socket, &mut buf)? {
            RecvOutcome::Datagram(n) => {
                received += 1;
                hooks.on_reply_received(&buf[..n], wall_clock_ms());
            }
            RecvOutcome::Timeout => {
                tracing::debug!(received, "no more replies, assuming trace finished");
                return Ok(received);
            }
        }
    }
}

// ─── Receiver ────────────────────────────────────────────────────────────────

/// Receive a trace pushed by the server over the connected `socket`,
/// answering each packet the hooks accept.
///
/// Waits up to [`ReplayConfig::first_packet_wait`] for the first packet,
/// then [`ReplayConfig::read_timeout`] between packets. Ends on the
/// end-of-trace message or on a read timeout.
pub fn run_receiver<H: ReplayHooks>(
    socket: UdpSocket,
    trace_duration_ms: i64,
    hooks: Arc<H>,
    cfg: &ReplayConfig,
) -> Result<ReplayReport, MeasurementError> {
    let local_addr = socket.local_addr()?;
    let deadline = join_deadline(trace_duration_ms, cfg);
    let cfg = cfg.clone();
    let receiver = Worker::spawn("voiperf-recv", move || receive_packets(&socket, hooks.as_ref(), &cfg))?;
    let (datagrams_received, packets_sent) = receiver.join_within(deadline)?;
    Ok(ReplayReport {
        local_addr,
        packets_sent,
        datagrams_received,
    })
}

fn punch_hole(socket: &UdpSocket, cfg: &ReplayConfig) -> Result<(), MeasurementError> {
    for _ in 0..cfg.hole_punch_count {
        socket.send(HOLE_PUNCH_MESSAGE)?;
        thread::sleep(cfg.hole_punch_interval);
    }
    tracing::debug!(count = cfg.hole_punch_count, "hole punching packets sent");
    Ok(())
}

fn receive_packets<H: ReplayHooks + ?Sized>(
    socket: &UdpSocket,
    hooks: &H,
    cfg: &ReplayConfig,
) -> Result<(usize, usize), MeasurementError> {
    socket.set_read_timeout(Some(cfg.first_packet_wait))?;
    punch_hole(socket, cfg)?;

    let mut buf = vec![0u8; cfg.max_packet_size];
    let mut reply = BytesMut::with_capacity(cfg.max_packet_size);
    let mut received = 0;
    let mut replied = 0;
    loop {
        let n = match recv_or_timeout(socket, &mut buf)? {
            RecvOutcome::Datagram(n) => n,
            RecvOutcome::Timeout => {
                tracing::debug!(received, "socket timeout, assuming trace finished");
                break;
            }
        };
        if received == 0 {
            socket.set_read_timeout(Some(cfg.read_timeout))?;
            tracing::debug!(timeout = ?cfg.read_timeout, "first trace packet received");
        }
        let now = wall_clock_ms();
        let datagram = &buf[..n];
        if datagram == END_OF_TRACE_MESSAGE {
            tracing::info!(received, "end of trace received");
            break;
        }
        received += 1;
        reply.clear();
        if hooks.on_inbound_packet(datagram, now, &mut reply) {
            socket.send(&reply)?;
            replied += 1;
        }
    }
    Ok((received, replied))
}
