//! Loading trace files from disk.

use bytes::BytesMut;
use std::io::Write;
use voiperf_trace::trace::{Trace, TraceError, TracePacket, TraceV1};
use voiperf_trace::{RtpHeader, RtpTrace};

fn rtp_packet(ts: f64, seq: u16) -> TracePacket {
    let mut payload = BytesMut::new();
    RtpHeader {
        version: 2,
        payload_type: 8,
        sequence_number: seq,
        timestamp: u32::from(seq) * 160,
        ssrc: 0xCAFE,
        ..Default::default()
    }
    .encode(&mut payload);
    payload.extend_from_slice(&[0xD5; 160]);
    TracePacket::new(ts, payload.freeze())
}

#[test]
fn rtp_trace_survives_a_trip_through_disk() {
    let mut rtp = RtpTrace::new(12, 5004);
    for (i, seq) in [500u16, 501, 502, 504].into_iter().enumerate() {
        assert!(rtp.push(rtp_packet(i as f64 * 0.25, seq)).unwrap());
    }
    let trace = Trace::Rtp(rtp);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    trace.write_to(file.as_file_mut()).unwrap();

    let loaded = Trace::load(file.path()).unwrap();
    assert_eq!(loaded.version(), 3);
    assert_eq!(loaded.id(), 12);
    assert_eq!(loaded.dport(), 5004);
    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded.duration_millis(), 750);
    let rtp = loaded.as_rtp().unwrap();
    assert_eq!(rtp.sequence_range(), 5);
    assert_eq!(rtp.packets()[3].rtp.unwrap().sequence_number, 504);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Trace::load(dir.path().join("absent.trace")).unwrap_err();
    assert!(matches!(err, TraceError::Io(_)));
}

#[test]
fn garbage_file_reports_unknown_version() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"not a trace file at all").unwrap();
    file.flush().unwrap();
    assert!(matches!(
        Trace::load(file.path()).unwrap_err(),
        TraceError::UnknownVersion(_)
    ));
}

#[test]
fn warm_up_style_trace_loads_as_v1() {
    let mut v1 = TraceV1::new(3, 0);
    for i in 0..50 {
        v1.push(TracePacket::new(f64::from(i) * 0.5, vec![0u8; 40]));
    }
    let mut file = tempfile::NamedTempFile::new().unwrap();
    Trace::V1(v1).write_to(file.as_file_mut()).unwrap();

    let loaded = Trace::load(file.path()).unwrap();
    assert_eq!(loaded.version(), 1);
    assert_eq!(loaded.len(), 50);
    assert_eq!(loaded.duration_millis(), 24_500);
}
