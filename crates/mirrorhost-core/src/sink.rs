//! Telemetry sink: where replayed samples go.
//!
//! [`TelemetrySink`] is the seam the replay engine sends through.
//! [`TrapperSink`] speaks the trapper "sender data" protocol over TCP:
//!
//! ```text
//! +------+-------+-----------------+---------------------------+
//! | ZBXD | 0x01  | u64 LE length   | JSON payload (length B)   |
//! +------+-------+-----------------+---------------------------+
//! ```
//!
//! One connection per batch; the server answers with a single frame whose
//! `info` string carries processed/failed/total counts.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::SinkConfig;
use crate::error::{Result, SinkError};
use crate::model::MetricValue;

/// Frame magic.
pub const FRAME_MAGIC: &[u8; 4] = b"ZBXD";
/// Protocol flag for an uncompressed frame.
pub const FRAME_FLAG_PLAIN: u8 = 0x01;
/// Magic + flag + length.
pub const FRAME_HEADER_LEN: usize = 13;
/// Largest payload accepted from the server.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<SendReport>> + Send + 'a>>;

/// One sample addressed to a destination host/key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    pub host: String,
    pub key: String,
    pub value: MetricValue,
    /// Emission time (epoch seconds)
    pub clock: i64,
}

/// Counts reported by the sink for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReport {
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
    pub seconds_spent: Option<f64>,
    /// Raw server detail string, if any
    pub details: Option<String>,
}

impl SendReport {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

pub trait TelemetrySink: Send + Sync {
    fn name(&self) -> &str;

    /// Send one batch. The batch has already passed [`validate_batch`].
    fn send<'a>(&'a self, batch: &'a [Emission]) -> SinkFuture<'a>;
}

/// Reject a batch containing any emission with an empty host, empty key or
/// null value. Nothing is sent when this fails.
pub fn validate_batch(batch: &[Emission]) -> std::result::Result<(), SinkError> {
    for (idx, emission) in batch.iter().enumerate() {
        if emission.host.trim().is_empty() {
            return Err(SinkError::Validation(format!("emission {idx}: empty host")));
        }
        if emission.key.trim().is_empty() {
            return Err(SinkError::Validation(format!(
                "emission {idx} for {}: empty key",
                emission.host
            )));
        }
        if emission.value.is_null() {
            return Err(SinkError::Validation(format!(
                "emission {idx} for {}/{}: null value",
                emission.host, emission.key
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Serialize)]
struct SenderRequest<'a> {
    request: &'static str,
    data: Vec<SenderItem<'a>>,
}

#[derive(Serialize)]
struct SenderItem<'a> {
    host: &'a str,
    key: &'a str,
    value: String,
    clock: i64,
}

#[derive(Deserialize)]
struct SenderResponse {
    response: String,
    #[serde(default)]
    info: Option<String>,
}

/// Encode a batch as a complete request frame.
pub fn encode_request(batch: &[Emission]) -> std::result::Result<Vec<u8>, SinkError> {
    let request = SenderRequest {
        request: "sender data",
        data: batch
            .iter()
            .map(|e| SenderItem {
                host: &e.host,
                key: &e.key,
                value: e.value.to_string(),
                clock: e.clock,
            })
            .collect(),
    };
    let payload = serde_json::to_vec(&request)
        .map_err(|e| SinkError::Protocol(format!("encode request: {e}")))?;
    Ok(encode_frame(&payload))
}

#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(FRAME_MAGIC);
    frame.push(FRAME_FLAG_PLAIN);
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Parse a frame header, returning the payload length it announces.
pub fn decode_header(header: &[u8]) -> std::result::Result<usize, SinkError> {
    if header.len() < FRAME_HEADER_LEN {
        return Err(SinkError::Protocol(format!(
            "short header: {} bytes",
            header.len()
        )));
    }
    if &header[..4] != FRAME_MAGIC {
        return Err(SinkError::Protocol("bad frame magic".to_string()));
    }
    if header[4] != FRAME_FLAG_PLAIN {
        return Err(SinkError::Protocol(format!(
            "unsupported frame flags 0x{:02x}",
            header[4]
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[5..FRAME_HEADER_LEN]);
    let len = u64::from_le_bytes(len_bytes);
    usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_FRAME_BYTES)
        .ok_or_else(|| SinkError::Protocol(format!("frame too large: {len} bytes")))
}

/// Decode one complete frame, returning its payload.
pub fn decode_frame(frame: &[u8]) -> std::result::Result<&[u8], SinkError> {
    let len = decode_header(frame)?;
    let body = &frame[FRAME_HEADER_LEN..];
    if body.len() != len {
        return Err(SinkError::Protocol(format!(
            "frame announces {len} bytes, carries {}",
            body.len()
        )));
    }
    Ok(body)
}

/// Turn a response payload into a [`SendReport`].
pub fn decode_response(payload: &[u8]) -> std::result::Result<SendReport, SinkError> {
    let response: SenderResponse = serde_json::from_slice(payload)
        .map_err(|e| SinkError::Protocol(format!("decode response: {e}")))?;
    if response.response != "success" {
        return Err(SinkError::Protocol(format!(
            "server answered '{}': {}",
            response.response,
            response.info.unwrap_or_default()
        )));
    }
    let info = response.info.unwrap_or_default();
    let mut report = parse_info(&info);
    report.details = (!info.is_empty()).then_some(info);
    Ok(report)
}

/// Parse `processed: N; failed: M; total: T; seconds spent: S`.
///
/// Unknown or malformed fields are ignored.
#[must_use]
pub fn parse_info(info: &str) -> SendReport {
    let mut report = SendReport::default();
    for field in info.split(';') {
        let Some((name, value)) = field.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim() {
            "processed" => report.processed = value.parse().unwrap_or(0),
            "failed" => report.failed = value.parse().unwrap_or(0),
            "total" => report.total = value.parse().unwrap_or(0),
            "seconds spent" => report.seconds_spent = value.parse().ok(),
            _ => {}
        }
    }
    report
}

// =============================================================================
// TCP sink
// =============================================================================

/// Trapper protocol client.
#[derive(Debug, Clone)]
pub struct TrapperSink {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TrapperSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        if config.host.trim().is_empty() {
            return Err(SinkError::Setup("sink host is empty".to_string()).into());
        }
        if config.port == 0 {
            return Err(SinkError::Setup("sink port is 0".to_string()).into());
        }
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            io_timeout: Duration::from_millis(config.io_timeout_ms),
        })
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> std::result::Result<TcpStream, SinkError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| SinkError::Setup(format!("resolve {}: {e}", self.address())))?;
        let Some(addr) = addrs.next() else {
            return Err(SinkError::Setup(format!(
                "{} resolved to no addresses",
                self.address()
            )));
        };

        timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SinkError::Timeout(duration_ms(self.connect_timeout)))?
            .map_err(|e| SinkError::Transport(format!("connect {addr}: {e}")))
    }

    async fn exchange(&self, request: &[u8]) -> std::result::Result<SendReport, SinkError> {
        let mut stream = self.connect().await?;
        let io_ms = duration_ms(self.io_timeout);

        timeout(self.io_timeout, stream.write_all(request))
            .await
            .map_err(|_| SinkError::Timeout(io_ms))?
            .map_err(|e| SinkError::Transport(format!("write: {e}")))?;

        let mut header = [0u8; FRAME_HEADER_LEN];
        timeout(self.io_timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| SinkError::Timeout(io_ms))?
            .map_err(|e| SinkError::Transport(format!("read header: {e}")))?;
        let len = decode_header(&header)?;

        let mut payload = vec![0u8; len];
        timeout(self.io_timeout, stream.read_exact(&mut payload))
            .await
            .map_err(|_| SinkError::Timeout(io_ms))?
            .map_err(|e| SinkError::Transport(format!("read payload: {e}")))?;

        decode_response(&payload)
    }
}

impl TelemetrySink for TrapperSink {
    fn name(&self) -> &str {
        "trapper"
    }

    fn send<'a>(&'a self, batch: &'a [Emission]) -> SinkFuture<'a> {
        Box::pin(async move {
            let request = encode_request(batch)?;
            let started = Instant::now();
            let report = self.exchange(&request).await?;
            debug!(
                address = %self.address(),
                emissions = batch.len(),
                processed = report.processed,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Batch sent"
            );
            if report.has_failures() {
                warn!(
                    address = %self.address(),
                    failed = report.failed,
                    total = report.total,
                    "Trapper server rejected part of the batch"
                );
            }
            Ok(report)
        })
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::net::TcpListener;

    fn emission(host: &str, key: &str, value: MetricValue) -> Emission {
        Emission {
            host: host.to_string(),
            key: key.to_string(),
            value,
            clock: 1_700_000_000,
        }
    }

    #[test]
    fn validation_rejects_the_whole_batch() {
        let good = emission("web01", "trapper.cpu", MetricValue::Integer(5));
        assert!(validate_batch(std::slice::from_ref(&good)).is_ok());

        for bad in [
            emission("", "k", MetricValue::Integer(1)),
            emission("h", " ", MetricValue::Integer(1)),
            emission("h", "k", MetricValue::Null),
        ] {
            let err = validate_batch(&[good.clone(), bad]).unwrap_err();
            assert!(matches!(err, SinkError::Validation(_)));
            assert!(err.is_setup());
        }
    }

    #[test]
    fn request_frame_layout() {
        let frame = encode_request(&[emission("web01", "cpu", MetricValue::Float(7.5))]).unwrap();
        assert_eq!(&frame[..4], b"ZBXD");
        assert_eq!(frame[4], 0x01);
        let payload = decode_frame(&frame).unwrap();
        let json: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(json["request"], "sender data");
        assert_eq!(json["data"][0]["host"], "web01");
        assert_eq!(json["data"][0]["value"], "7.5");
        assert_eq!(json["data"][0]["clock"], 1_700_000_000);
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        assert!(decode_frame(b"ZBX").is_err());
        assert!(decode_frame(b"XXXX\x01\x00\x00\x00\x00\x00\x00\x00\x00").is_err());
        assert!(decode_frame(b"ZBXD\x03\x00\x00\x00\x00\x00\x00\x00\x00").is_err());
        // Announces 5 bytes, carries 2.
        assert!(decode_frame(b"ZBXD\x01\x05\x00\x00\x00\x00\x00\x00\x00{}").is_err());
        let mut huge = b"ZBXD\x01".to_vec();
        huge.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(decode_header(&huge).is_err());
    }

    #[test]
    fn info_string_parses_counts() {
        let report = parse_info("processed: 3; failed: 1; total: 4; seconds spent: 0.000055");
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total, 4);
        assert!(report.seconds_spent.is_some());
        assert!(report.has_failures());

        let empty = parse_info("garbage");
        assert_eq!(empty, SendReport::default());
    }

    #[test]
    fn non_success_response_is_protocol_error() {
        let err = decode_response(br#"{"response":"failed","info":"bad"}"#).unwrap_err();
        assert!(matches!(err, SinkError::Protocol(_)));
    }

    #[test]
    fn empty_host_or_zero_port_is_setup_error() {
        let err = TrapperSink::new(&SinkConfig {
            host: String::new(),
            ..SinkConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Sink(SinkError::Setup(_))));

        let err = TrapperSink::new(&SinkConfig {
            port: 0,
            ..SinkConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Sink(SinkError::Setup(_))));
    }

    #[tokio::test]
    async fn sends_batch_to_listening_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; FRAME_HEADER_LEN];
            socket.read_exact(&mut header).await.unwrap();
            let len = decode_header(&header).unwrap();
            let mut payload = vec![0u8; len];
            socket.read_exact(&mut payload).await.unwrap();
            let request: serde_json::Value = serde_json::from_slice(&payload).unwrap();
            let n = request["data"].as_array().unwrap().len();

            let body = serde_json::json!({
                "response": "success",
                "info": format!("processed: {n}; failed: 0; total: {n}; seconds spent: 0.000100"),
            });
            let frame = encode_frame(body.to_string().as_bytes());
            socket.write_all(&frame).await.unwrap();
            n
        });

        let sink = TrapperSink::new(&SinkConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..SinkConfig::default()
        })
        .unwrap();
        let batch = vec![
            emission("web01", "cpu", MetricValue::Integer(5)),
            emission("web01", "mem", MetricValue::Text("ok".into())),
        ];
        let report = sink.send(&batch).await.unwrap();

        assert_eq!(server.await.unwrap(), 2);
        assert_eq!(report.processed, 2);
        assert_eq!(report.total, 2);
        assert!(!report.has_failures());
        assert!(report.details.unwrap().starts_with("processed: 2"));
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let sink = TrapperSink::new(&SinkConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..SinkConfig::default()
        })
        .unwrap();
        let err = sink
            .send(&[emission("h", "k", MetricValue::Integer(1))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sink(SinkError::Transport(_))));
    }
}
