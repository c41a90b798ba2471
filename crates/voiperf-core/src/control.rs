//! # Control Channel
//!
//! One TCP connection per session carries a line-oriented handshake and
//! length-prefixed JSON blobs:
//!
//! ```text
//! S: OK | BUSY
//! C: <len>\n<client info JSON>
//! C: <len>\n<gzip traceroute JSON>       (or "0\n")
//! for each task:
//!   C: <task type>\n<trace info line>\n<trace info line>\n
//!   S: <udp address>\n<udp port>\n
//!      ... UDP exchange ...
//!   C: <len>\n<gzip telemetry JSON>
//!   S: <len>\n<statistics JSON>
//! C: END\n
//! C: <len>\n<gzip network status JSON>   (or "0\n")
//! ```
//!
//! Blob lengths are decimal ASCII byte counts of what follows.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use voiperf_trace::Trace;

use crate::config::ServerConfig;
use crate::error::MeasurementError;
use crate::replay::{ReplayKind, ReplayTelemetry};

pub const AVAILABLE: &str = "OK";
pub const BUSY: &str = "BUSY";
pub const END_OF_MEASUREMENTS: &str = "END";

/// Upper bound on a blob the server may send us.
pub const MAX_BLOB_LEN: usize = 16 * 1024 * 1024;
/// Longest control line accepted from the server, terminator included.
pub const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Busy,
}

/// Where the server wants a task's UDP exchange to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEndpoint {
    pub host: String,
    pub port: u16,
}

impl UdpEndpoint {
    pub fn resolve(&self) -> Result<SocketAddr, MeasurementError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| MeasurementError::protocol(format!("cannot resolve {}:{}", self.host, self.port)))
    }
}

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalAddress {
    #[serde(rename = "IP")]
    pub ip: String,
    pub port: u16,
}

impl From<SocketAddr> for LocalAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub device_info: Value,
    pub phone_status: Value,
    pub network_status: Value,
    pub client_local_address: Option<LocalAddress>,
    pub preferences: Value,
}

/// Client-side view of one task, sent after the UDP exchange.
#[derive(Debug, Clone, Serialize)]
pub struct TaskTelemetry {
    pub local_address: LocalAddress,
    #[serde(flatten)]
    pub replay: ReplayTelemetry,
    /// Edge latency probe output; `null` when there was no first hop.
    pub ping_rtts: Option<Value>,
}

/// The server's verdict on one task.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TraceStatistics {
    /// Fraction of packets lost, 0.0 to 1.0.
    pub packet_loss: f64,
    pub avg_rate_kbits: f64,
}

impl TraceStatistics {
    /// Loss in whole percent, truncated.
    pub fn packet_loss_percent(&self) -> f64 {
        (self.packet_loss * 100.0).trunc()
    }

    pub fn rate_kbits(&self) -> f64 {
        self.avg_rate_kbits.trunc()
    }

    /// Not computed yet; always 0.
    pub fn average_jitter(&self) -> f64 {
        0.0
    }

    /// Not computed yet; always 0.
    pub fn mos(&self) -> f64 {
        0.0
    }
}

/// The two trace description lines sent after the task type.
///
/// Senders announce the trace id and packet count; receivers name the
/// trace file so the server can load the same one, then give its id.
pub fn trace_info_lines(kind: ReplayKind, trace: &Trace, trace_file: &Path) -> [String; 2] {
    match kind {
        ReplayKind::RtpSend | ReplayKind::RandomSend => [trace.id().to_string(), trace.len().to_string()],
        ReplayKind::RtpRecv | ReplayKind::RandomRecv => {
            let name = trace_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            [name, trace.id().to_string()]
        }
    }
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

// ─── Channel ─────────────────────────────────────────────────────────────────

pub struct ControlChannel<R, W> {
    reader: R,
    writer: W,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

pub type TcpControlChannel = ControlChannel<BufReader<TcpStream>, TcpStream>;

impl TcpControlChannel {
    pub fn connect(server: &ServerConfig) -> Result<Self, MeasurementError> {
        let addr = server.socket_addr()?;
        tracing::info!(%addr, "connecting to measurement server");
        let stream = TcpStream::connect_timeout(&addr, server.connect_timeout)?;
        stream.set_read_timeout(Some(server.read_timeout))?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
            local_addr,
            peer_addr,
        })
    }

    pub fn close(self) {
        if let Err(e) = self.writer.shutdown(std::net::Shutdown::Both) {
            tracing::debug!(error = %e, "control connection already closed");
        }
        tracing::info!("disconnected from measurement server");
    }
}

impl<R: BufRead, W: Write> ControlChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            local_addr: None,
            peer_addr: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn read_line(&mut self) -> Result<String, MeasurementError> {
        let mut line = String::new();
        let n = (&mut self.reader).take(MAX_LINE_LEN as u64).read_line(&mut line)?;
        if n == 0 {
            return Err(MeasurementError::protocol("control connection closed by server"));
        }
        if n == MAX_LINE_LEN && !line.ends_with('\n') {
            return Err(MeasurementError::protocol(format!(
                "control line longer than {MAX_LINE_LEN} bytes"
            )));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        Ok(trimmed.to_string())
    }

    pub fn send_line(&mut self, line: &str) -> Result<(), MeasurementError> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn read_availability(&mut self) -> Result<Availability, MeasurementError> {
        let line = self.read_line()?;
        match line.as_str() {
            AVAILABLE => Ok(Availability::Available),
            BUSY => Ok(Availability::Busy),
            other => Err(MeasurementError::protocol(format!(
                "unknown measurement server message {other:?}"
            ))),
        }
    }

    pub fn send_blob(&mut self, data: &[u8]) -> Result<(), MeasurementError> {
        self.writer.write_all(format!("{}\n", data.len()).as_bytes())?;
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn send_empty_blob(&mut self) -> Result<(), MeasurementError> {
        self.send_blob(&[])
    }

    pub fn send_json_blob<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), MeasurementError> {
        let data = serde_json::to_vec(value)?;
        self.send_blob(&data)
    }

    pub fn send_compressed_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), MeasurementError> {
        let data = serde_json::to_vec(value)?;
        let compressed = gzip(&data)?;
        tracing::debug!(raw = data.len(), compressed = compressed.len(), "sending compressed blob");
        self.send_blob(&compressed)
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, MeasurementError> {
        let line = self.read_line()?;
        let len: usize = line
            .trim()
            .parse()
            .map_err(|_| MeasurementError::protocol(format!("invalid blob length {line:?}")))?;
        if len > MAX_BLOB_LEN {
            return Err(MeasurementError::protocol(format!("blob of {len} bytes is too large")));
        }
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }

    pub fn read_json_blob<T: DeserializeOwned>(&mut self) -> Result<T, MeasurementError> {
        let data = self.read_blob()?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Announce a task and learn where its UDP exchange goes.
    pub fn begin_task(&mut self, kind: ReplayKind, info: &[String; 2]) -> Result<UdpEndpoint, MeasurementError> {
        self.send_line(kind.wire_name())?;
        for line in info {
            self.send_line(line)?;
        }
        let host = self.read_line()?.trim().to_string();
        let port_line = self.read_line()?;
        let port = port_line
            .trim()
            .parse()
            .map_err(|_| MeasurementError::protocol(format!("invalid UDP port {port_line:?}")))?;
        if host.is_empty() {
            return Err(MeasurementError::protocol("empty UDP address"));
        }
        tracing::info!(task = %kind, %host, port, "trace exchange endpoint");
        Ok(UdpEndpoint { host, port })
    }

    pub fn read_statistics(&mut self) -> Result<TraceStatistics, MeasurementError> {
        self.read_json_blob()
    }

    /// End the session, sending the recorded network status samples.
    pub fn finish(&mut self, statuses: Option<&Value>) -> Result<(), MeasurementError> {
        self.send_line(END_OF_MEASUREMENTS)?;
        match statuses {
            Some(v) => self.send_compressed_json(v),
            None => self.send_empty_blob(),
        }
    }
}
