//! Per-role packet handling plugged into the shared replay loops.

use std::sync::Mutex;

use bytes::BytesMut;
use serde::Serialize;
use voiperf_trace::{PacketFooter, RtpHeader, RtpTrace, TracePacket};

use super::TimestampTable;

/// Client-side measurements of one replay, as reported to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayTelemetry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_rtts: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_timestamps: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_timestamps: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_seq: Option<Vec<i64>>,
}

/// Role-specific behaviour of a replay.
///
/// Sender roles use [`prepare_outbound_packet`] (sender thread) and
/// [`on_reply_received`] (reply thread); receiver roles use
/// [`on_inbound_packet`]. All timestamps are wall-clock milliseconds.
///
/// [`prepare_outbound_packet`]: ReplayHooks::prepare_outbound_packet
/// [`on_reply_received`]: ReplayHooks::on_reply_received
/// [`on_inbound_packet`]: ReplayHooks::on_inbound_packet
pub trait ReplayHooks: Send + Sync + 'static {
    /// Fill `out` with the datagram for the `index`-th trace packet.
    /// Returning `false` skips the packet.
    fn prepare_outbound_packet(&self, index: usize, packet: &TracePacket, now_ms: i64, out: &mut BytesMut) -> bool {
        let _ = (index, now_ms);
        out.extend_from_slice(&packet.payload);
        true
    }

    fn on_reply_received(&self, datagram: &[u8], now_ms: i64) {
        let _ = (datagram, now_ms);
    }

    /// Record a trace packet and fill `reply`. Returning `false` sends no reply.
    fn on_inbound_packet(&self, datagram: &[u8], now_ms: i64, reply: &mut BytesMut) -> bool {
        let _ = (datagram, now_ms, reply);
        false
    }

    fn telemetry(&self) -> ReplayTelemetry;
}

// ─── RTP send ────────────────────────────────────────────────────────────────

/// Sends an RTP trace verbatim; replies carry the RTP header back.
#[derive(Debug)]
pub struct RtpSendHooks {
    min_seq: u16,
    sent: TimestampTable,
    replies: TimestampTable,
}

impl RtpSendHooks {
    pub fn new(trace: &RtpTrace) -> Self {
        let range = trace.sequence_range();
        Self {
            min_seq: trace.min_sequence().unwrap_or(0),
            sent: TimestampTable::new(range),
            replies: TimestampTable::new(range),
        }
    }

    fn slot(&self, seq: u16) -> Option<usize> {
        seq.checked_sub(self.min_seq)
            .map(usize::from)
            .filter(|&i| i < self.sent.len())
    }

    /// Reply minus send time per sequence number, `-1` if no reply.
    pub fn rtts(&self) -> Vec<i64> {
        (0..self.replies.len())
            .map(|i| match (self.replies.get(i), self.sent.get(i)) {
                (Some(reply), Some(sent)) => reply - sent,
                _ => -1,
            })
            .collect()
    }
}

impl ReplayHooks for RtpSendHooks {
    fn prepare_outbound_packet(&self, _index: usize, packet: &TracePacket, now_ms: i64, out: &mut BytesMut) -> bool {
        let Some(header) = packet.rtp else {
            tracing::warn!("RTP trace packet without header");
            return false;
        };
        let Some(slot) = self.slot(header.sequence_number) else {
            tracing::warn!(seq = header.sequence_number, "sequence number outside trace range, not sending");
            return false;
        };
        self.sent.set(slot, now_ms);
        out.extend_from_slice(&packet.payload);
        true
    }

    fn on_reply_received(&self, datagram: &[u8], now_ms: i64) {
        let seq = match RtpHeader::sequence_number(datagram) {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(error = %e, "reply without a valid RTP header");
                return;
            }
        };
        match self.slot(seq) {
            Some(slot) => {
                self.replies.record_first(slot, now_ms);
            }
            None => tracing::warn!(seq, "reply with sequence number outside trace range"),
        }
    }

    fn telemetry(&self) -> ReplayTelemetry {
        ReplayTelemetry {
            trace_rtts: Some(self.rtts()),
            sent_timestamps: Some(self.sent.snapshot()),
            ..Default::default()
        }
    }
}

// ─── Random send ─────────────────────────────────────────────────────────────

/// Sends a raw trace with a [`PacketFooter`] stamped on each packet; the
/// server echoes the footer, which carries the send time.
#[derive(Debug)]
pub struct RandomSendHooks {
    max_packet_size: usize,
    reply_at: TimestampTable,
    sent_at: TimestampTable,
}

impl RandomSendHooks {
    pub fn new(packets: usize, max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            reply_at: TimestampTable::new(packets),
            sent_at: TimestampTable::new(packets),
        }
    }

    pub fn rtts(&self) -> Vec<i64> {
        (0..self.reply_at.len())
            .map(|i| match (self.reply_at.get(i), self.sent_at.get(i)) {
                (Some(reply), Some(sent)) => reply - sent,
                _ => -1,
            })
            .collect()
    }
}

impl ReplayHooks for RandomSendHooks {
    fn prepare_outbound_packet(&self, index: usize, packet: &TracePacket, now_ms: i64, out: &mut BytesMut) -> bool {
        if packet.size() > self.max_packet_size {
            tracing::warn!(index, size = packet.size(), "trace packet larger than the send buffer");
            return false;
        }
        // Payloads shorter than a footer go out as recorded and get no reply.
        PacketFooter::append(&packet.payload, index as u32, now_ms, out, self.max_packet_size);
        true
    }

    fn on_reply_received(&self, datagram: &[u8], now_ms: i64) {
        let footer = match PacketFooter::decode(datagram) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "reply without a footer");
                return;
            }
        };
        let slot = footer.seq as usize;
        if slot >= self.reply_at.len() {
            tracing::warn!(seq = footer.seq, "reply with sequence number outside trace range");
            return;
        }
        if self.reply_at.record_first(slot, now_ms) {
            self.sent_at.set(slot, footer.timestamp_ms);
        }
    }

    fn telemetry(&self) -> ReplayTelemetry {
        ReplayTelemetry {
            trace_rtts: Some(self.rtts()),
            ..Default::default()
        }
    }
}

// ─── Receivers ───────────────────────────────────────────────────────────────

/// Arrivals logged per expected trace packet before the log stops growing.
pub const ARRIVAL_LOG_FACTOR: usize = 4;
/// Floor for the arrival log limit, for very short traces.
pub const ARRIVAL_LOG_MIN: usize = 16;

/// Arrival log kept by the receiver roles. Only the receiver thread writes.
#[derive(Debug, Default)]
struct ArrivalLog {
    timestamps: Vec<i64>,
    sequences: Vec<i64>,
    limit: usize,
    dropped: usize,
}

impl ArrivalLog {
    fn for_trace(expected: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(expected),
            sequences: Vec::with_capacity(expected),
            limit: expected.saturating_mul(ARRIVAL_LOG_FACTOR).max(ARRIVAL_LOG_MIN),
            dropped: 0,
        }
    }

    fn record(&mut self, now_ms: i64, seq: Option<i64>) {
        if self.timestamps.len() >= self.limit {
            if self.dropped == 0 {
                tracing::warn!(limit = self.limit, "arrival log full, ignoring further packets");
            }
            self.dropped += 1;
            return;
        }
        self.timestamps.push(now_ms);
        self.sequences.push(seq.unwrap_or(-1));
    }

    fn telemetry(&self) -> ReplayTelemetry {
        ReplayTelemetry {
            recv_timestamps: Some(self.timestamps.clone()),
            recv_seq: Some(self.sequences.clone()),
            ..Default::default()
        }
    }
}

/// Receives an RTP trace and echoes each packet's 12-byte header.
#[derive(Debug)]
pub struct RtpRecvHooks {
    log: Mutex<ArrivalLog>,
}

impl RtpRecvHooks {
    pub fn new(expected: usize) -> Self {
        Self {
            log: Mutex::new(ArrivalLog::for_trace(expected)),
        }
    }
}

impl ReplayHooks for RtpRecvHooks {
    fn on_inbound_packet(&self, datagram: &[u8], now_ms: i64, reply: &mut BytesMut) -> bool {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        match RtpHeader::sequence_number(datagram) {
            Ok(seq) => {
                log.record(now_ms, Some(i64::from(seq)));
                reply.extend_from_slice(&datagram[..RtpHeader::SIZE]);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "trace packet without a valid RTP header");
                log.record(now_ms, None);
                false
            }
        }
    }

    fn telemetry(&self) -> ReplayTelemetry {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).telemetry()
    }
}

/// Receives a raw trace and echoes each packet's footer.
#[derive(Debug)]
pub struct RandomRecvHooks {
    log: Mutex<ArrivalLog>,
}

impl RandomRecvHooks {
    pub fn new(expected: usize) -> Self {
        Self {
            log: Mutex::new(ArrivalLog::for_trace(expected)),
        }
    }
}

impl ReplayHooks for RandomRecvHooks {
    fn on_inbound_packet(&self, datagram: &[u8], now_ms: i64, reply: &mut BytesMut) -> bool {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        match PacketFooter::extract_sequence(datagram, datagram.len()) {
            Ok(seq) => {
                log.record(now_ms, Some(i64::from(seq)));
                reply.extend_from_slice(&datagram[datagram.len() - PacketFooter::SIZE..]);
                true
            }
            // Too small to carry a footer; nothing to answer.
            Err(_) => {
                log.record(now_ms, None);
                false
            }
        }
    }

    fn telemetry(&self) -> ReplayTelemetry {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).telemetry()
    }
}
