//! # Trace Files
//!
//! Binary, big-endian, terminated by EOF:
//!
//! ```text
//! preamble: i32 version | i32 id | i16 dport
//! record:   f64 timestamp (s) | i16 payload length | payload
//! ```
//!
//! Version 1 carries raw payloads. Version 3 payloads start with a
//! 12-byte RTP header, and records repeating an already-seen sequence
//! number are dropped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use crate::rtp::RtpHeader;

/// Preamble size: version + id + dport.
pub const PREAMBLE_SIZE: usize = 10;

/// Fixed part of a record: timestamp + payload length.
pub const RECORD_HEADER_SIZE: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("unknown trace version {0}")]
    UnknownVersion(i32),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid RTP header in record {index}")]
    InvalidRtpHeader { index: usize },
    #[error("negative payload length {length} in record {index}")]
    NegativeLength { index: usize, length: i16 },
    #[error("payload of {0} bytes does not fit a trace record")]
    PayloadTooLarge(usize),
    #[error("trace I/O: {0}")]
    Io(#[from] io::Error),
}

// ─── Packets ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TracePacket {
    /// Capture timestamp as recorded, in seconds.
    pub ts_seconds: f64,
    /// `ts_seconds * 1000`, truncated.
    pub ts_millis: i64,
    /// Full recorded payload (for RTP traces this includes the header).
    pub payload: Bytes,
    /// Parsed header, RTP traces only.
    pub rtp: Option<RtpHeader>,
}

impl TracePacket {
    pub fn new(ts_seconds: f64, payload: impl Into<Bytes>) -> Self {
        Self {
            ts_seconds,
            ts_millis: (ts_seconds * 1000.0) as i64,
            payload: payload.into(),
            rtp: None,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

fn duration_of(packets: &[TracePacket]) -> i64 {
    match (packets.first(), packets.last()) {
        (Some(first), Some(last)) => last.ts_millis - first.ts_millis,
        _ => 0,
    }
}

// ─── Version 1 ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TraceV1 {
    pub id: i32,
    pub dport: u16,
    packets: Vec<TracePacket>,
}

impl TraceV1 {
    pub const VERSION: i32 = 1;

    pub fn new(id: i32, dport: u16) -> Self {
        Self {
            id,
            dport,
            packets: Vec::new(),
        }
    }

    pub fn push(&mut self, packet: TracePacket) {
        self.packets.push(packet);
    }

    pub fn packets(&self) -> &[TracePacket] {
        &self.packets
    }
}

// ─── Version 3 (RTP) ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RtpTrace {
    pub id: i32,
    pub dport: u16,
    packets: Vec<TracePacket>,
    seen: HashSet<u16>,
    min_seq: Option<u16>,
    max_seq: Option<u16>,
}

impl RtpTrace {
    pub const VERSION: i32 = 3;

    pub fn new(id: i32, dport: u16) -> Self {
        Self {
            id,
            dport,
            ..Default::default()
        }
    }

    /// Parse the RTP header from the payload and append the packet.
    ///
    /// Returns `Ok(false)` if the sequence number was already present; the
    /// earlier packet is kept.
    pub fn push(&mut self, mut packet: TracePacket) -> Result<bool, crate::TooShort> {
        let header = RtpHeader::parse(&packet.payload)?;
        let seq = header.sequence_number;
        if !self.seen.insert(seq) {
            return Ok(false);
        }
        self.min_seq = Some(self.min_seq.map_or(seq, |m| m.min(seq)));
        self.max_seq = Some(self.max_seq.map_or(seq, |m| m.max(seq)));
        packet.rtp = Some(header);
        self.packets.push(packet);
        Ok(true)
    }

    pub fn packets(&self) -> &[TracePacket] {
        &self.packets
    }

    pub fn min_sequence(&self) -> Option<u16> {
        self.min_seq
    }

    pub fn max_sequence(&self) -> Option<u16> {
        self.max_seq
    }

    /// `max - min + 1`, or 0 for an empty trace. Sizes per-sequence tables.
    pub fn sequence_range(&self) -> usize {
        match (self.min_seq, self.max_seq) {
            (Some(min), Some(max)) => usize::from(max - min) + 1,
            _ => 0,
        }
    }
}

// ─── Trace ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Trace {
    V1(TraceV1),
    Rtp(RtpTrace),
}

impl Trace {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "loading trace file");
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file)).inspect_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to read trace");
        })
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self, TraceError> {
        let mut preamble = [0u8; PREAMBLE_SIZE];
        read_full(&mut reader, &mut preamble)?;
        let mut pre = &preamble[..];
        let version = pre.get_i32();
        let id = pre.get_i32();
        let dport = pre.get_u16();

        match version {
            TraceV1::VERSION => {
                let mut trace = TraceV1::new(id, dport);
                while let Some(packet) = read_record(&mut reader, trace.packets.len())? {
                    trace.push(packet);
                }
                Ok(Trace::V1(trace))
            }
            RtpTrace::VERSION => {
                let mut trace = RtpTrace::new(id, dport);
                let mut index = 0;
                while let Some(packet) = read_record(&mut reader, index)? {
                    match trace.push(packet) {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(record = index, "duplicate RTP sequence number, skipping");
                        }
                        Err(_) => return Err(TraceError::InvalidRtpHeader { index }),
                    }
                    index += 1;
                }
                Ok(Trace::Rtp(trace))
            }
            other => Err(TraceError::UnknownVersion(other)),
        }
    }

    pub fn version(&self) -> i32 {
        match self {
            Trace::V1(_) => TraceV1::VERSION,
            Trace::Rtp(_) => RtpTrace::VERSION,
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            Trace::V1(t) => t.id,
            Trace::Rtp(t) => t.id,
        }
    }

    pub fn dport(&self) -> u16 {
        match self {
            Trace::V1(t) => t.dport,
            Trace::Rtp(t) => t.dport,
        }
    }

    pub fn packets(&self) -> &[TracePacket] {
        match self {
            Trace::V1(t) => t.packets(),
            Trace::Rtp(t) => t.packets(),
        }
    }

    pub fn len(&self) -> usize {
        self.packets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets().is_empty()
    }

    /// Last packet timestamp minus first, in milliseconds.
    pub fn duration_millis(&self) -> i64 {
        duration_of(self.packets())
    }

    pub fn as_rtp(&self) -> Option<&RtpTrace> {
        match self {
            Trace::Rtp(t) => Some(t),
            Trace::V1(_) => None,
        }
    }

    /// Serialise back to the on-disk format.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), TraceError> {
        buf.reserve(PREAMBLE_SIZE);
        buf.put_i32(self.version());
        buf.put_i32(self.id());
        buf.put_u16(self.dport());
        for packet in self.packets() {
            let len = i16::try_from(packet.size()).map_err(|_| TraceError::PayloadTooLarge(packet.size()))?;
            buf.reserve(RECORD_HEADER_SIZE + packet.size());
            buf.put_f64(packet.ts_seconds);
            buf.put_i16(len);
            buf.put_slice(&packet.payload);
        }
        Ok(())
    }

    pub fn write_to(&self, mut writer: impl Write) -> Result<(), TraceError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }
}

// ─── Decoding helpers ────────────────────────────────────────────────────────

/// Fill `buf` completely; returns the number of bytes read before EOF.
fn read_until_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), TraceError> {
    if read_until_eof(reader, buf)? < buf.len() {
        return Err(TraceError::UnexpectedEof);
    }
    Ok(())
}

/// Read one record. `None` when EOF falls exactly on a record boundary.
fn read_record(reader: &mut impl Read, index: usize) -> Result<Option<TracePacket>, TraceError> {
    let mut head = [0u8; RECORD_HEADER_SIZE];
    match read_until_eof(reader, &mut head)? {
        0 => return Ok(None),
        n if n < RECORD_HEADER_SIZE => return Err(TraceError::UnexpectedEof),
        _ => {}
    }
    let mut head = &head[..];
    let ts = head.get_f64();
    let length = head.get_i16();
    if length < 0 {
        return Err(TraceError::NegativeLength { index, length });
    }
    let mut payload = vec![0u8; length as usize];
    read_full(reader, &mut payload)?;
    Ok(Some(TracePacket::new(ts, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_payload(seq: u16, body: &[u8]) -> Vec<u8> {
        let header = RtpHeader {
            version: 2,
            payload_type: 0,
            sequence_number: seq,
            timestamp: u32::from(seq) * 160,
            ssrc: 0x1234,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(body);
        buf.to_vec()
    }

    fn preamble(version: i32, id: i32, dport: u16) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(version);
        buf.put_i32(id);
        buf.put_u16(dport);
        buf
    }

    fn record(buf: &mut BytesMut, ts: f64, payload: &[u8]) {
        buf.put_f64(ts);
        buf.put_i16(payload.len() as i16);
        buf.put_slice(payload);
    }

    #[test]
    fn v1_trace_decodes_in_file_order() {
        let mut buf = preamble(1, 77, 5004);
        record(&mut buf, 0.0, b"aaaa");
        record(&mut buf, 0.1, b"bb");
        record(&mut buf, 0.25, b"");

        let trace = Trace::from_reader(&buf[..]).unwrap();
        assert_eq!(trace.version(), 1);
        assert_eq!(trace.id(), 77);
        assert_eq!(trace.dport(), 5004);
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.packets()[1].payload.as_ref(), b"bb");
        assert_eq!(trace.packets()[1].ts_millis, 100);
        assert_eq!(trace.duration_millis(), 250);
        assert!(trace.as_rtp().is_none());
    }

    #[test]
    fn ts_millis_truncates() {
        assert_eq!(TracePacket::new(1.2349, Bytes::new()).ts_millis, 1234);
    }

    #[test]
    fn rtp_trace_drops_duplicates_keeping_first() {
        let mut buf = preamble(3, 1, 0);
        record(&mut buf, 0.00, &rtp_payload(10, b"first"));
        record(&mut buf, 0.02, &rtp_payload(11, b"x"));
        record(&mut buf, 0.04, &rtp_payload(10, b"second"));
        record(&mut buf, 0.06, &rtp_payload(13, b"y"));

        let trace = Trace::from_reader(&buf[..]).unwrap();
        let rtp = trace.as_rtp().unwrap();
        assert_eq!(rtp.packets().len(), 3);
        let seqs: Vec<u16> = rtp
            .packets()
            .iter()
            .map(|p| p.rtp.unwrap().sequence_number)
            .collect();
        assert_eq!(seqs, vec![10, 11, 13]);
        assert!(rtp.packets()[0].payload.ends_with(b"first"));
        assert_eq!(rtp.min_sequence(), Some(10));
        assert_eq!(rtp.max_sequence(), Some(13));
        assert_eq!(rtp.sequence_range(), 4);
    }

    #[test]
    fn short_rtp_payload_is_rejected() {
        let mut buf = preamble(3, 1, 0);
        record(&mut buf, 0.0, &rtp_payload(1, b""));
        record(&mut buf, 0.1, &[0u8; 11]);
        let err = Trace::from_reader(&buf[..]).unwrap_err();
        assert!(matches!(err, TraceError::InvalidRtpHeader { index: 1 }));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let buf = preamble(2, 1, 0);
        assert!(matches!(
            Trace::from_reader(&buf[..]).unwrap_err(),
            TraceError::UnknownVersion(2)
        ));
    }

    #[test]
    fn truncated_preamble_is_an_error() {
        let buf = preamble(1, 1, 0);
        assert!(matches!(
            Trace::from_reader(&buf[..7]).unwrap_err(),
            TraceError::UnexpectedEof
        ));
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut buf = preamble(1, 1, 0);
        record(&mut buf, 0.0, b"complete");
        record(&mut buf, 0.1, b"truncated");
        let cut = buf.len() - 3;
        assert!(matches!(
            Trace::from_reader(&buf[..cut]).unwrap_err(),
            TraceError::UnexpectedEof
        ));
        // Cut inside the timestamp of the second record.
        let cut = PREAMBLE_SIZE + RECORD_HEADER_SIZE + 8 + 4;
        assert!(matches!(
            Trace::from_reader(&buf[..cut]).unwrap_err(),
            TraceError::UnexpectedEof
        ));
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut buf = preamble(1, 1, 0);
        buf.put_f64(0.0);
        buf.put_i16(-4);
        assert!(matches!(
            Trace::from_reader(&buf[..]).unwrap_err(),
            TraceError::NegativeLength { index: 0, length: -4 }
        ));
    }

    #[test]
    fn empty_rtp_trace_has_zero_range() {
        let buf = preamble(3, 9, 0);
        let trace = Trace::from_reader(&buf[..]).unwrap();
        assert!(trace.is_empty());
        assert_eq!(trace.as_rtp().unwrap().sequence_range(), 0);
        assert_eq!(trace.duration_millis(), 0);
    }

    #[test]
    fn encode_reproduces_input_bytes() {
        let mut buf = preamble(3, 5, 4000);
        record(&mut buf, 0.5, &rtp_payload(100, b"abc"));
        record(&mut buf, 0.52, &rtp_payload(101, b"def"));
        let trace = Trace::from_reader(&buf[..]).unwrap();

        let mut out = BytesMut::new();
        trace.encode(&mut out).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn oversized_payload_cannot_be_encoded() {
        let mut v1 = TraceV1::new(1, 0);
        v1.push(TracePacket::new(0.0, vec![0u8; 40_000]));
        let mut out = BytesMut::new();
        assert!(matches!(
            Trace::V1(v1).encode(&mut out).unwrap_err(),
            TraceError::PayloadTooLarge(40_000)
        ));
    }
}
