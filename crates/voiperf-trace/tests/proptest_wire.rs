//! Property-based tests for the RTP header, packet footer and trace codecs.

use bytes::BytesMut;
use proptest::prelude::*;
use voiperf_trace::trace::{Trace, TracePacket, TraceV1};
use voiperf_trace::{PacketFooter, RtpHeader, RtpTrace};

// ─── Strategies ──────────────────────────────────────────────────────────────

fn rtp_header() -> impl Strategy<Value = RtpHeader> {
    (
        0u8..4,
        any::<bool>(),
        any::<bool>(),
        0u8..16,
        any::<bool>(),
        0u8..128,
        any::<u16>(),
        any::<u32>(),
        any::<u32>(),
    )
        .prop_map(|(version, padding, extension, csrc_count, marker, payload_type, sequence_number, timestamp, ssrc)| {
            RtpHeader {
                version,
                padding,
                extension,
                csrc_count,
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
            }
        })
}

proptest! {
    #[test]
    fn rtp_header_roundtrip(h in rtp_header(), tail in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        prop_assert_eq!(buf.len(), RtpHeader::SIZE);
        buf.extend_from_slice(&tail);

        prop_assert_eq!(RtpHeader::parse(&buf).unwrap(), h);
        prop_assert_eq!(RtpHeader::sequence_number(&buf).unwrap(), h.sequence_number);
    }

    #[test]
    fn footer_roundtrip(
        seq in any::<u32>(),
        ts in any::<i64>(),
        payload in proptest::collection::vec(any::<u8>(), PacketFooter::SIZE..1500),
    ) {
        let mut out = BytesMut::new();
        prop_assert!(PacketFooter::append(&payload, seq, ts, &mut out, 1500));
        prop_assert_eq!(out.len(), payload.len());
        prop_assert_eq!(PacketFooter::decode(&out).unwrap(), PacketFooter::new(seq, ts));
        prop_assert_eq!(PacketFooter::extract_sequence(&out, out.len()).unwrap(), seq);
    }

    #[test]
    fn short_payload_never_gets_a_footer(payload in proptest::collection::vec(any::<u8>(), 0..PacketFooter::SIZE)) {
        let mut out = BytesMut::new();
        prop_assert!(!PacketFooter::append(&payload, 1, 1, &mut out, 1500));
        prop_assert_eq!(&out[..], &payload[..]);
    }

    #[test]
    fn sequence_range_counts_distinct_sequences(
        start in 0u16..60_000,
        count in 1usize..200,
    ) {
        let mut trace = RtpTrace::new(1, 0);
        // Contiguous sequence numbers in reverse order.
        for i in (0..count).rev() {
            let h = RtpHeader { version: 2, sequence_number: start + i as u16, ..Default::default() };
            let mut payload = BytesMut::new();
            h.encode(&mut payload);
            prop_assert!(trace.push(TracePacket::new(i as f64 * 0.02, payload.freeze())).unwrap());
        }
        prop_assert_eq!(trace.sequence_range(), count);
        prop_assert_eq!(trace.packets().len(), count);
    }

    #[test]
    fn v1_trace_reencodes_identically(
        records in proptest::collection::vec(
            (0.0f64..3600.0, proptest::collection::vec(any::<u8>(), 0..256)),
            0..32,
        ),
    ) {
        let mut v1 = TraceV1::new(42, 9000);
        for (ts, payload) in &records {
            v1.push(TracePacket::new(*ts, payload.clone()));
        }
        let trace = Trace::V1(v1);
        let mut buf = BytesMut::new();
        trace.encode(&mut buf).unwrap();

        let back = Trace::from_reader(&buf[..]).unwrap();
        prop_assert_eq!(back, trace);
    }
}
