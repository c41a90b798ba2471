//! Whole sessions against a fake measurement server on loopback.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use flate2::read::GzDecoder;
use serde_json::Value;
use voiperf_core::config::{ReplayConfig, VoiperfConfig};
use voiperf_core::context::{MemoryResultStore, SessionContext, StaticDeviceInfo, WakeLock};
use voiperf_core::replay::{Direction, ReplayKind, END_OF_TRACE_MESSAGE};
use voiperf_core::session::{MeasurementListener, MeasurementSession, SessionOutcome};
use voiperf_core::tasks::MeasurementTask;
use voiperf_trace::{PacketFooter, Trace, TracePacket, TraceV1};

#[derive(Default)]
struct RecordingListener {
    outcomes: Mutex<Vec<SessionOutcome>>,
}

impl MeasurementListener for RecordingListener {
    fn measurement_finished(&self, outcome: SessionOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }
}

#[derive(Default)]
struct CountingWakeLock {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }
    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    ctx: SessionContext,
    results: Arc<MemoryResultStore>,
    wake: Arc<CountingWakeLock>,
    _dir: tempfile::TempDir,
}

fn fixture(port: u16) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut trace = TraceV1::new(3, 5004);
    for t in [0.0, 0.02, 0.04] {
        trace.push(TracePacket::new(t, vec![0x11; 120]));
    }
    Trace::V1(trace)
        .write_to(File::create(dir.path().join("up.trace")).unwrap())
        .unwrap();

    let mut config = VoiperfConfig::default();
    config.server.address = "127.0.0.1".into();
    config.server.port = port;
    config.server.connect_timeout = Duration::from_secs(2);
    config.server.read_timeout = Duration::from_secs(5);
    config.paths.traces_dir = dir.path().to_path_buf();
    config.replay = ReplayConfig {
        read_timeout: Duration::from_millis(300),
        join_margin: Duration::from_secs(5),
        ..ReplayConfig::default()
    };

    let results = Arc::new(MemoryResultStore::new());
    let wake = Arc::new(CountingWakeLock::default());
    let ctx = SessionContext::new(
        config,
        Arc::new(StaticDeviceInfo {
            unique_id: "test-device".into(),
        }),
    )
    .with_results(results.clone())
    .with_wake_lock(wake.clone());
    Fixture {
        ctx,
        results,
        wake,
        _dir: dir,
    }
}

fn read_line(reader: &mut impl BufRead) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line.trim_end().to_string()
}

fn read_blob(reader: &mut impl BufRead) -> Vec<u8> {
    let len: usize = read_line(reader).parse().unwrap();
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).unwrap();
    data
}

fn gunzip_json(data: &[u8]) -> Value {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).unwrap();
    serde_json::from_slice(&out).unwrap()
}

fn write_blob(stream: &mut TcpStream, data: &[u8]) {
    stream.write_all(format!("{}\n", data.len()).as_bytes()).unwrap();
    stream.write_all(data).unwrap();
}

fn udp_echo() -> (u16, thread::JoinHandle<usize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let port = socket.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 2048];
        let mut count = 0;
        loop {
            let (n, peer) = socket.recv_from(&mut buf).unwrap();
            if &buf[..n] == END_OF_TRACE_MESSAGE {
                return count;
            }
            count += 1;
            socket.send_to(&buf[n - PacketFooter::SIZE..n], peer).unwrap();
        }
    });
    (port, handle)
}

const UPLOAD: [MeasurementTask; 1] = [MeasurementTask::new(ReplayKind::RandomSend, "up.trace")];

#[test]
fn full_session_reports_success_and_stores_results() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let fx = fixture(listener.local_addr().unwrap().port());

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        stream.write_all(b"OK\n").unwrap();

        let client: Value = serde_json::from_slice(&read_blob(&mut reader)).unwrap();
        assert_eq!(client["device_info"]["unique_id"], "test-device");
        assert_eq!(client["client_local_address"]["IP"], "127.0.0.1");
        assert_eq!(client["preferences"]["scheduler_type"], "FixedRepeatScheduler");
        assert!(read_blob(&mut reader).is_empty(), "no traceroute available");

        assert_eq!(read_line(&mut reader), "RANDOM_SEND");
        assert_eq!(read_line(&mut reader), "3");
        assert_eq!(read_line(&mut reader), "3");
        let (udp_port, udp) = udp_echo();
        stream.write_all(format!("127.0.0.1\n{udp_port}\n").as_bytes()).unwrap();

        let telemetry = gunzip_json(&read_blob(&mut reader));
        assert_eq!(telemetry["local_address"]["IP"], "127.0.0.1");
        assert_eq!(telemetry["trace_rtts"].as_array().unwrap().len(), 3);
        assert!(telemetry["ping_rtts"].is_null());
        assert_eq!(udp.join().unwrap(), 3);

        write_blob(&mut stream, br#"{"packet_loss":0.25,"avg_rate_kbits":10.7}"#);
        assert_eq!(read_line(&mut reader), "END");
        assert!(read_blob(&mut reader).is_empty());
    });

    let listener_rec = RecordingListener::default();
    let outcome = MeasurementSession::new(fx.ctx.clone(), UPLOAD).run(&listener_rec);
    server.join().unwrap();

    assert_eq!(outcome, SessionOutcome::SUCCESS);
    assert_eq!(*listener_rec.outcomes.lock().unwrap(), vec![SessionOutcome::SUCCESS]);
    let results = fx.results.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].packet_loss, 25.0);
    assert_eq!(results[0].rate, 10.0);
    assert_eq!(results[0].direction, Direction::Up);
    assert_eq!(fx.wake.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(fx.wake.released.load(Ordering::SeqCst), 1);
}

#[test]
fn busy_server_is_reported_as_busy() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let fx = fixture(listener.local_addr().unwrap().port());
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"BUSY\n").unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
        rest
    });

    let rec = RecordingListener::default();
    let outcome = MeasurementSession::new(fx.ctx.clone(), UPLOAD).run(&rec);
    assert!(server.join().unwrap().is_empty(), "client must not send after BUSY");

    assert!(outcome.connected);
    assert!(outcome.busy);
    assert!(outcome.failed);
    assert!(fx.results.results().is_empty());
    assert_eq!(fx.wake.released.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_greeting_fails_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let fx = fixture(listener.local_addr().unwrap().port());
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"HELLO\n").unwrap();
    });

    let rec = RecordingListener::default();
    let outcome = MeasurementSession::new(fx.ctx.clone(), UPLOAD).run(&rec);
    server.join().unwrap();
    assert_eq!(
        outcome,
        SessionOutcome {
            connected: true,
            busy: false,
            failed: true
        }
    );
}

#[test]
fn missing_trace_aborts_after_negotiation() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let fx = fixture(listener.local_addr().unwrap().port());
    std::fs::remove_file(fx.ctx.config.trace_path("up.trace")).unwrap();
    assert!(!Path::new(&fx.ctx.config.trace_path("up.trace")).exists());

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        stream.write_all(b"OK\n").unwrap();
        read_blob(&mut reader);
        read_blob(&mut reader);
        // The client gives up before announcing any task.
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    });

    let rec = RecordingListener::default();
    let outcome = MeasurementSession::new(fx.ctx.clone(), UPLOAD).run(&rec);
    assert_eq!(server.join().unwrap(), "");
    assert!(outcome.connected);
    assert!(outcome.failed);
    assert!(!outcome.busy);
}

#[test]
fn unreachable_server_is_not_connected() {
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let fx = fixture(port);
    let rec = RecordingListener::default();
    let outcome = MeasurementSession::new(fx.ctx.clone(), UPLOAD).run(&rec);
    assert!(!outcome.connected);
    assert!(outcome.failed);
    assert_eq!(rec.outcomes.lock().unwrap().len(), 1);
    assert_eq!(fx.wake.released.load(Ordering::SeqCst), 1);
}
