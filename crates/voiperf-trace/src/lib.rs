//! # voiperf-trace
//!
//! Recorded packet traces and the fixed-layout codecs used to replay them.
//!
//! ## Crate structure
//!
//! - [`trace`] — Versioned binary trace files (`TraceV1`, `RtpTrace`)
//! - [`rtp`] — 12-byte RTP header codec
//! - [`footer`] — 12-byte sequence/timestamp trailer for synthetic packets

pub mod footer;
pub mod rtp;
pub mod trace;

pub use footer::PacketFooter;
pub use rtp::RtpHeader;
pub use trace::{RtpTrace, Trace, TraceError, TracePacket, TraceV1};

/// A buffer was shorter than the fixed-size record it should contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer too short: need {needed} bytes, got {got}")]
pub struct TooShort {
    pub needed: usize,
    pub got: usize,
}

impl TooShort {
    pub(crate) fn check(needed: usize, got: usize) -> Result<(), TooShort> {
        if got < needed {
            Err(TooShort { needed, got })
        } else {
            Ok(())
        }
    }
}
