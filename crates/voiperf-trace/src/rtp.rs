//! # RTP Header
//!
//! Only the 12-byte fixed header of RFC 3550 is used; CSRC lists and
//! extensions are carried opaquely in the payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::TooShort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtpHeader {
    /// 2-bit protocol version.
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    /// 4-bit CSRC count.
    pub csrc_count: u8,
    pub marker: bool,
    /// 7-bit payload type.
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub const SIZE: usize = 12;

    /// Parse the header from the first 12 bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, TooShort> {
        TooShort::check(Self::SIZE, buf.len())?;
        let mut buf = &buf[..Self::SIZE];
        let b0 = buf.get_u8();
        let b1 = buf.get_u8();
        Ok(Self {
            version: b0 >> 6,
            padding: b0 & 0x20 != 0,
            extension: b0 & 0x10 != 0,
            csrc_count: b0 & 0x0F,
            marker: b1 & 0x80 != 0,
            payload_type: b1 & 0x7F,
            sequence_number: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
        })
    }

    /// Read only the sequence number, skipping the rest of the header.
    #[inline]
    pub fn sequence_number(buf: &[u8]) -> Result<u16, TooShort> {
        TooShort::check(Self::SIZE, buf.len())?;
        Ok(u16::from_be_bytes([buf[2], buf[3]]))
    }

    fn first_byte(&self) -> u8 {
        ((self.version & 0x03) << 6)
            | (u8::from(self.padding) << 5)
            | (u8::from(self.extension) << 4)
            | (self.csrc_count & 0x0F)
    }

    fn second_byte(&self) -> u8 {
        (u8::from(self.marker) << 7) | (self.payload_type & 0x7F)
    }

    /// Append the encoded header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u8(self.first_byte());
        buf.put_u8(self.second_byte());
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Write the header into the front of `out`. Returns `false` (and
    /// writes nothing) if `out` is shorter than [`Self::SIZE`].
    pub fn write_to(&self, out: &mut [u8]) -> bool {
        if out.len() < Self::SIZE {
            return false;
        }
        let mut dst = &mut out[..Self::SIZE];
        dst.put_u8(self.first_byte());
        dst.put_u8(self.second_byte());
        dst.put_u16(self.sequence_number);
        dst.put_u32(self.timestamp);
        dst.put_u32(self.ssrc);
        true
    }
}

impl fmt::Display for RtpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RTP v{} pt={} seq={} ts={} ssrc={:#010x}{}",
            self.version,
            self.payload_type,
            self.sequence_number,
            self.timestamp,
            self.ssrc,
            if self.marker { " M" } else { "" }
        )
    }
}
