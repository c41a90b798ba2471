//! # Packet Footer
//!
//! Synthetic ("random") traces carry no RTP header, so the sender stamps
//! each datagram with a 12-byte trailer instead:
//!
//! ```text
//! +---------------------------+-----------------+----------------------+
//! | payload[..len - 12]       | sequence (u32)  | send time ms (i64)   |
//! +---------------------------+-----------------+----------------------+
//! ```
//!
//! The trailer overwrites the tail of the recorded payload, so the
//! datagram keeps the recorded size. Payloads shorter than the trailer go
//! out unmodified and cannot be matched to a reply.

use bytes::{Buf, BufMut, BytesMut};

use crate::TooShort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFooter {
    pub seq: u32,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl PacketFooter {
    pub const SIZE: usize = 12;

    pub fn new(seq: u32, timestamp_ms: i64) -> Self {
        Self { seq, timestamp_ms }
    }

    /// Copy `payload` into `out`, stamping the footer over its last
    /// [`Self::SIZE`] bytes.
    ///
    /// Returns `false` when no footer was written:
    /// - `payload` exceeds `capacity`: only the first `capacity` bytes are copied;
    /// - `payload` is shorter than the footer: it is copied verbatim.
    pub fn append(payload: &[u8], seq: u32, timestamp_ms: i64, out: &mut BytesMut, capacity: usize) -> bool {
        if payload.len() > capacity {
            out.extend_from_slice(&payload[..capacity]);
            return false;
        }
        if payload.len() < Self::SIZE {
            out.extend_from_slice(payload);
            return false;
        }
        out.reserve(payload.len());
        out.extend_from_slice(&payload[..payload.len() - Self::SIZE]);
        out.put_u32(seq);
        out.put_i64(timestamp_ms);
        true
    }

    /// Sequence number from the footer at the end of `buf[..len]`.
    pub fn extract_sequence(buf: &[u8], len: usize) -> Result<u32, TooShort> {
        let len = len.min(buf.len());
        TooShort::check(Self::SIZE, len)?;
        let mut tail = &buf[len - Self::SIZE..len];
        Ok(tail.get_u32())
    }

    /// Decode the footer from the last [`Self::SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, TooShort> {
        TooShort::check(Self::SIZE, buf.len())?;
        let mut tail = &buf[buf.len() - Self::SIZE..];
        Ok(Self {
            seq: tail.get_u32(),
            timestamp_ms: tail.get_i64(),
        })
    }

    /// The footer on its own, as sent in a reply.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut dst = &mut out[..];
        dst.put_u32(self.seq);
        dst.put_i64(self.timestamp_ms);
        out
    }
}
