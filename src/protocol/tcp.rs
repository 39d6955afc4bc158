//! Framed-TCP receiver
//!
//! One packet is one frame; the stream is scanned for start/end marker
//! pairs inside a large preallocated buffer. Exactly one client is served
//! at a time; a second connection is aborted while the first is live.
//! Buffer overflow discards the in-flight bytes and resynchronizes on the
//! next start marker the producer emits.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::ProtocolControl;
use crate::wire;

/// Preallocated scan buffer: peak frame sizes plus safety margin.
pub const SCAN_BUFFER_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TcpReceiverConfig {
    pub socket_buffer_bytes: usize,
    /// Overridable for tests; production uses [`SCAN_BUFFER_SIZE`].
    pub scan_buffer_size: usize,
}

impl Default for TcpReceiverConfig {
    fn default() -> Self {
        Self {
            socket_buffer_bytes: 32 * 1024 * 1024,
            scan_buffer_size: SCAN_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Default)]
pub struct TcpReceiverStats {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub frames_received: AtomicU64,
    pub malformed: AtomicU64,
    pub crc_mismatches: AtomicU64,
    pub buffer_overflows: AtomicU64,
    pub acks_sent: AtomicU64,
}

/// The TCP protocol task. Accepts connections and scans the byte stream
/// for framed packets.
pub struct TcpReceiver {
    listener: TcpListener,
    out: mpsc::Sender<(u32, Bytes)>,
    control: Arc<ProtocolControl>,
    config: TcpReceiverConfig,
    stats: Arc<TcpReceiverStats>,
}

impl TcpReceiver {
    pub fn new(
        listener: TcpListener,
        out: mpsc::Sender<(u32, Bytes)>,
        control: Arc<ProtocolControl>,
        config: TcpReceiverConfig,
    ) -> Self {
        Self {
            listener,
            out,
            control,
            config,
            stats: Arc::new(TcpReceiverStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<TcpReceiverStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until aborted; each accepted connection is served on its own
    /// task so surplus connections can be rejected promptly.
    pub async fn run(self) {
        info!(local = ?self.listener.local_addr().ok(), "TCP listener started");

        loop {
            tokio::select! {
                _ = self.control.aborted() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if !self.control.try_connect() {
                        self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(%peer, "second connection aborted, one client at a time");
                        drop(stream);
                        continue;
                    }
                    self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    info!(%peer, "producer connected");

                    let conn = Connection {
                        out: self.out.clone(),
                        control: Arc::clone(&self.control),
                        stats: Arc::clone(&self.stats),
                        scan_buffer_size: self.config.scan_buffer_size,
                        socket_buffer_bytes: self.config.socket_buffer_bytes,
                    };
                    tokio::spawn(conn.run(stream));
                }
            }
        }

        self.control.mark_closed();
        info!("TCP listener closed");
    }
}

struct Connection {
    out: mpsc::Sender<(u32, Bytes)>,
    control: Arc<ProtocolControl>,
    stats: Arc<TcpReceiverStats>,
    scan_buffer_size: usize,
    socket_buffer_bytes: usize,
}

impl Connection {
    async fn run(self, mut stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }
        super::tune_socket_buffers(socket2::SockRef::from(&stream), self.socket_buffer_bytes);

        let mut buffer = vec![0u8; self.scan_buffer_size];
        let mut write_offset = 0usize;
        let mut scratch = vec![0u8; 64 * 1024];

        loop {
            let read = tokio::select! {
                _ = self.control.aborted() => break,
                read = stream.read(&mut scratch) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "TCP read error");
                    break;
                }
            };
            if self.control.is_stopped() {
                continue;
            }

            if write_offset + n > buffer.len() {
                self.stats.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                warn!(
                    write_offset,
                    incoming = n,
                    "scan buffer overflow, resynchronizing from next start marker"
                );
                write_offset = 0;
            }
            buffer[write_offset..write_offset + n].copy_from_slice(&scratch[..n]);
            write_offset += n;

            write_offset = self
                .process_buffer(&mut stream, &mut buffer, write_offset)
                .await;
        }

        self.control.disconnect();
        self.control.mark_closed();
        info!("producer disconnected");
    }

    /// Locates start/end marker pairs, handles every complete packet, and
    /// compacts the unprocessed tail to the front of the buffer. Returns
    /// the new write offset.
    async fn process_buffer(
        &self,
        stream: &mut TcpStream,
        buffer: &mut [u8],
        write_offset: usize,
    ) -> usize {
        let mut cursor = 0usize;
        while cursor < write_offset {
            let Some(start) = find_marker(&buffer[..write_offset], &wire::START_MARKER, cursor)
            else {
                break;
            };
            let Some(end) = find_marker(
                &buffer[..write_offset],
                &wire::END_MARKER,
                start + wire::START_MARKER.len(),
            ) else {
                break;
            };
            let packet = &buffer[start..end + wire::END_MARKER.len()];
            self.handle_packet(stream, packet).await;
            cursor = end + wire::END_MARKER.len();
        }

        let remaining = write_offset - cursor;
        if remaining > 0 && cursor > 0 {
            buffer.copy_within(cursor..write_offset, 0);
        }
        remaining
    }

    async fn handle_packet(&self, stream: &mut TcpStream, packet: &[u8]) {
        let (header, payload) = match wire::decode_frame(packet) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = packet.len(), "malformed packet dropped");
                return;
            }
        };

        if wire::crc32(&payload) != header.crc32 {
            self.stats.crc_mismatches.fetch_add(1, Ordering::Relaxed);
            warn!(frame_id = header.frame_id, "checksum mismatch");
        }

        // Full-frame ACK before delivery.
        let ack = wire::encode_tcp_ack(header.frame_id);
        if let Err(e) = stream.write_all(&ack).await {
            warn!(error = %e, "failed to write ACK");
        } else {
            self.stats.acks_sent.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        debug!(frame_id = header.frame_id, bytes = payload.len(), "frame received");

        if self.out.try_send((header.frame_id, payload)).is_err() {
            warn!(frame_id = header.frame_id, "downstream queue full, frame dropped");
        }
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 4], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|pos| pos + from)
}
