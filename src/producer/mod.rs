//! Producer side: encode stage plus the transport senders
//!
//! Mirrors the server: a frame source feeds an encode worker, encoded
//! frames go out through the reliable chunk sender (UDP) or as one framed
//! packet per frame (TCP). Before streaming, the producer announces
//! itself on the control plane so the server opens (or resets) the
//! stream.

mod source;

pub use source::{FileSource, FrameSource, TestPatternSource};

use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::codec::{encode_jpeg, H264Encoder, RawFrame};
use crate::config::{Config, Format, Transport};
use crate::sender::{ReliableSender, SenderConfig, SenderHandle};
use crate::wire;

/// CLI-level options for one producer run.
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    /// Server address (control plane and ingest share the host).
    pub dest_host: String,
    /// Stop after this many frames; `None` streams until interrupted.
    pub frames: Option<u64>,
    /// Raw BGR frame dump to stream instead of the test pattern.
    pub source_file: Option<String>,
    /// Skip the `/reset_stream` announcement (for tests).
    pub announce: bool,
}

impl Default for ProduceOptions {
    fn default() -> Self {
        Self {
            dest_host: "127.0.0.1".to_string(),
            frames: None,
            source_file: None,
            announce: true,
        }
    }
}

/// Encodes raw frames into the server's incoming payload format.
enum PayloadEncoder {
    Jpeg { quality: u8 },
    H264(Box<H264Encoder>),
}

impl PayloadEncoder {
    fn new(config: &Config) -> Result<Self> {
        Ok(match config.variant.incoming {
            Format::Jpg => Self::Jpeg {
                quality: config.codec.jpeg_quality,
            },
            Format::H264 => Self::H264(Box::new(H264Encoder::new(&config.codec)?)),
        })
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Option<Bytes>> {
        match self {
            Self::Jpeg { quality } => Ok(Some(encode_jpeg(frame, *quality)?)),
            Self::H264(encoder) => Ok(encoder.encode(frame)?.map(|packet| packet.pack())),
        }
    }
}

/// Runs the producer pipeline against the configured server variant.
pub async fn run(config: Config, options: ProduceOptions) -> Result<()> {
    if options.announce {
        announce_stream(
            &options.dest_host,
            config.server.http_port,
            &config.server.auth_secret,
        )
        .await;
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    let source: Box<dyn FrameSource> = match &options.source_file {
        Some(path) => Box::new(
            FileSource::open(path, config.codec.width, config.codec.height)
                .with_context(|| format!("failed to open frame dump {path}"))?,
        ),
        None => Box::new(TestPatternSource::new(
            config.codec.width,
            config.codec.height,
            options.frames,
        )),
    };
    let encoded_rx = spawn_encode_stage(&config, source)?;

    match config.variant.transport {
        Transport::Udp => run_udp(&config, &options, encoded_rx).await,
        Transport::Tcp => run_tcp(&config, &options, encoded_rx).await,
    }
}

/// Encode worker: source frames in, encoded payloads out.
fn spawn_encode_stage(
    config: &Config,
    mut source: Box<dyn FrameSource>,
) -> Result<mpsc::Receiver<Bytes>> {
    let mut encoder = PayloadEncoder::new(config)?;
    let (tx, rx) = mpsc::channel(120);

    tokio::task::spawn_blocking(move || {
        while let Some(frame) = source.next_frame() {
            match encoder.encode(&frame) {
                Ok(Some(payload)) => {
                    if tx.blocking_send(payload).is_err() {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(e) => warn!(error = %e, "encode failed, frame skipped"),
            }
        }
        info!("frame source exhausted");
    });
    Ok(rx)
}

/// Once-per-second throughput log.
struct FpsMeter {
    count: u64,
    mark: Instant,
}

impl FpsMeter {
    fn new() -> Self {
        Self {
            count: 0,
            mark: Instant::now(),
        }
    }

    fn tick(&mut self) {
        self.count += 1;
        let elapsed = self.mark.elapsed();
        if elapsed >= Duration::from_secs(1) {
            info!(
                fps = format!("{:.2}", self.count as f64 / elapsed.as_secs_f64()),
                "producing"
            );
            self.count = 0;
            self.mark = Instant::now();
        }
    }
}

async fn run_udp(
    config: &Config,
    options: &ProduceOptions,
    mut encoded_rx: mpsc::Receiver<Bytes>,
) -> Result<()> {
    let dest: SocketAddr = format!("{}:{}", options.dest_host, config.ingest_port())
        .parse()
        .context("bad destination address")?;
    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    crate::protocol::tune_socket_buffers(
        socket2::SockRef::from(socket.as_ref()),
        config.tuning.socket_buffer_bytes,
    );

    let sender_config = SenderConfig {
        window_size: config.tuning.window_size,
        retransmit_timeout_ms: config.tuning.retransmit_timeout_ms,
        ..SenderConfig::default()
    };
    let (sender, handle) = ReliableSender::new(Arc::clone(&socket), dest, sender_config);
    let sender_task = tokio::spawn(sender.run());

    info!(%dest, "UDP producer streaming");
    let mut pace = frame_interval(config);
    let mut meter = FpsMeter::new();
    let mut frame_id = 0u32;

    while let Some(payload) = encoded_rx.recv().await {
        pace.tick().await;
        if handle.send_frame(frame_id, &payload).await.is_err() {
            break;
        }
        frame_id = wire::seq_next(frame_id);
        meter.tick();
    }

    drain_window(&handle).await;
    handle.shutdown().await;
    let _ = sender_task.await;
    Ok(())
}

async fn run_tcp(
    config: &Config,
    options: &ProduceOptions,
    mut encoded_rx: mpsc::Receiver<Bytes>,
) -> Result<()> {
    let dest = format!("{}:{}", options.dest_host, config.ingest_port());
    let stream = TcpStream::connect(&dest)
        .await
        .with_context(|| format!("failed to connect to {dest}"))?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    // ACKs are advisory on TCP; drain and count them.
    let ack_task = tokio::spawn(async move {
        let mut acked = 0u64;
        let mut buf = [0u8; wire::TCP_ACK_SIZE];
        while reader.read_exact(&mut buf).await.is_ok() {
            if wire::decode_tcp_ack(&buf).is_some() {
                acked += 1;
            }
        }
        info!(acked, "ACK reader finished");
        acked
    });

    info!(%dest, "TCP producer streaming");
    let mut pace = frame_interval(config);
    let mut meter = FpsMeter::new();
    let mut frame_id = 0u32;

    while let Some(payload) = encoded_rx.recv().await {
        pace.tick().await;
        let packet = wire::encode_frame(wire::wall_clock_ms(), frame_id, &payload);
        if let Err(e) = writer.write_all(&packet).await {
            warn!(error = %e, "TCP send failed");
            break;
        }
        frame_id = wire::seq_next(frame_id);
        meter.tick();
    }

    drop(writer);
    let _ = ack_task.await;
    Ok(())
}

fn frame_interval(config: &Config) -> tokio::time::Interval {
    tokio::time::interval(Duration::from_micros(1_000_000 / config.codec.fps as u64))
}

async fn drain_window(handle: &SenderHandle) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while handle.stats().in_flight.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Announces the stream on the control plane with a minimal HTTP/1.1
/// POST. Best effort: failure is logged and streaming proceeds.
pub async fn announce_stream(host: &str, http_port: u16, secret: &str) {
    let body = serde_json::json!({"message": "INIT_STREAM", "auth": secret}).to_string();
    let request = format!(
        "POST /reset_stream HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );

    let addr = format!("{host}:{http_port}");
    match TcpStream::connect(&addr).await {
        Ok(mut stream) => {
            if let Err(e) = stream.write_all(request.as_bytes()).await {
                warn!(error = %e, "failed to send stream announcement");
                return;
            }
            let mut response = Vec::new();
            let _ = stream.read_to_end(&mut response).await;
            let status = response
                .split(|&b| b == b'\r')
                .next()
                .map(|line| String::from_utf8_lossy(line).to_string())
                .unwrap_or_default();
            info!(%status, "stream announced");
        }
        Err(e) => warn!(%addr, error = %e, "control plane unreachable, streaming anyway"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariantConfig;

    #[test]
    fn test_jpeg_payload_encoder() {
        let mut config = Config::default();
        config.variant = VariantConfig {
            incoming: Format::Jpg,
            outgoing: Format::Jpg,
            transport: Transport::Udp,
            inference: false,
        };
        let mut encoder = PayloadEncoder::new(&config).unwrap();
        let mut source = TestPatternSource::new(64, 48, Some(1));
        let frame = source.next_frame().unwrap();

        let payload = encoder.encode(&frame).unwrap().unwrap();
        assert!(payload.starts_with(&[0xFF, 0xD8]), "JPEG SOI marker");
    }

    #[test]
    fn test_h264_payload_encoder_packs_framing() {
        let mut config = Config::default();
        config.variant.incoming = Format::H264;
        config.codec.width = 64;
        config.codec.height = 48;
        let mut encoder = PayloadEncoder::new(&config).unwrap();
        let mut source = TestPatternSource::new(64, 48, Some(1));
        let frame = source.next_frame().unwrap();

        let payload = encoder.encode(&frame).unwrap().unwrap();
        let packet = wire::H264Packet::unpack(&payload).unwrap();
        assert!(packet.is_keyframe, "first frame is IDR");
        assert!(!packet.data.is_empty());
    }
}
