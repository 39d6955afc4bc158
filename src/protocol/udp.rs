//! Chunked-UDP receiver and frame reassembler
//!
//! Each datagram carries one chunk of one frame. The receiver validates
//! the markers and length field, checks the CRC, acknowledges the chunk
//! immediately, deduplicates it, and slots it into the frame's reassembly
//! entry. A frame whose chunks stop arriving is evicted after
//! `reassembly_timeout`; completed frames are handed downstream as
//! `(frame_id, payload)`.
//!
//! The checksum is diagnostic: a mismatch is logged and, by default, the
//! chunk is still processed (the protocol has no negative-ACK, so dropping
//! silently would starve the frame until the producer's timer fires).

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::ProtocolControl;
use crate::wire;

/// Receiver knobs, lifted from the session tuning section.
#[derive(Debug, Clone)]
pub struct UdpReceiverConfig {
    pub reassembly_timeout: Duration,
    pub drop_on_crc_mismatch: bool,
    pub socket_buffer_bytes: usize,
}

impl Default for UdpReceiverConfig {
    fn default() -> Self {
        Self {
            reassembly_timeout: Duration::from_millis(500),
            drop_on_crc_mismatch: false,
            socket_buffer_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Counters for monitoring the reassembler.
#[derive(Debug, Default)]
pub struct UdpReceiverStats {
    pub datagrams: AtomicU64,
    pub malformed: AtomicU64,
    pub crc_mismatches: AtomicU64,
    pub duplicates: AtomicU64,
    pub acks_sent: AtomicU64,
    pub frames_completed: AtomicU64,
    pub frames_expired: AtomicU64,
    pub frames_dropped_downstream: AtomicU64,
}

struct FrameEntry {
    chunks: Vec<Option<Bytes>>,
    received: usize,
    started_at: Instant,
}

/// The UDP protocol task. Owns the socket and all reassembly state.
pub struct UdpReceiver {
    socket: UdpSocket,
    out: mpsc::Sender<(u32, Bytes)>,
    control: Arc<ProtocolControl>,
    config: UdpReceiverConfig,
    stats: Arc<UdpReceiverStats>,

    frames: HashMap<u32, FrameEntry>,
    received: HashMap<u32, HashSet<u8>>,
    // Recently completed ids, kept one timeout window so late retransmits
    // are treated as duplicates instead of reopening the frame.
    retired: HashMap<u32, Instant>,
}

impl UdpReceiver {
    pub fn new(
        socket: UdpSocket,
        out: mpsc::Sender<(u32, Bytes)>,
        control: Arc<ProtocolControl>,
        config: UdpReceiverConfig,
    ) -> Self {
        Self {
            socket,
            out,
            control,
            config,
            stats: Arc::new(UdpReceiverStats::default()),
            frames: HashMap::new(),
            received: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    pub fn stats(&self) -> Arc<UdpReceiverStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until aborted. On exit all reassembly state is cleared and the
    /// control handle is marked closed.
    pub async fn run(mut self) {
        super::tune_socket_buffers(
            socket2::SockRef::from(&self.socket),
            self.config.socket_buffer_bytes,
        );
        info!(local = ?self.socket.local_addr().ok(), "UDP listener started");

        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = self.control.aborted() => break,
                result = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = match result {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "UDP receive error");
                            break;
                        }
                    };
                    if self.control.is_stopped() {
                        continue;
                    }
                    self.stats.datagrams.fetch_add(1, Ordering::Relaxed);
                    self.sweep_expired();
                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    self.handle_datagram(datagram, addr).await;
                }
            }
        }

        self.frames.clear();
        self.received.clear();
        self.retired.clear();
        self.control.mark_closed();
        info!("UDP listener closed");
    }

    async fn handle_datagram(&mut self, datagram: Bytes, addr: SocketAddr) {
        let (header, payload) = match wire::decode_chunk(&datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = datagram.len(), "malformed datagram dropped");
                return;
            }
        };

        let crc_ok = wire::crc32(&payload) == header.crc32;
        if !crc_ok {
            self.stats.crc_mismatches.fetch_add(1, Ordering::Relaxed);
            warn!(
                frame_id = header.frame_id,
                chunk_index = header.chunk_index,
                "checksum mismatch"
            );
            if self.config.drop_on_crc_mismatch {
                // No ACK: the producer's retransmit timer will resend a
                // hopefully clean copy.
                return;
            }
        }

        trace!(
            frame_id = header.frame_id,
            chunk_index = header.chunk_index,
            transit_ms = wire::elapsed_ms(header.timestamp_ms, wire::wall_clock_ms()),
            "chunk received"
        );

        // ACK before anything else can observe the chunk.
        let ack = wire::encode_udp_ack(header.frame_id, header.chunk_index);
        if let Err(e) = self.socket.send_to(&ack, addr).await {
            warn!(error = %e, "failed to send ACK");
        } else {
            self.stats.acks_sent.fetch_add(1, Ordering::Relaxed);
        }

        if self.retired.contains_key(&header.frame_id) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let seen = self.received.entry(header.frame_id).or_default();
        if !seen.insert(header.chunk_index) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let entry = self.frames.entry(header.frame_id).or_insert_with(|| FrameEntry {
            chunks: vec![None; header.total_chunks as usize],
            received: 0,
            started_at: Instant::now(),
        });

        let slot = match entry.chunks.get_mut(header.chunk_index as usize) {
            Some(slot) => slot,
            None => {
                warn!(
                    frame_id = header.frame_id,
                    chunk_index = header.chunk_index,
                    total_chunks = entry.chunks.len(),
                    "chunk index out of range"
                );
                return;
            }
        };
        if slot.is_none() {
            *slot = Some(payload);
            entry.received += 1;
        }

        if entry.received == entry.chunks.len() {
            let entry = self.frames.remove(&header.frame_id).unwrap();
            self.received.remove(&header.frame_id);
            self.retired.insert(header.frame_id, Instant::now());

            let mut full = BytesMut::with_capacity(
                entry.chunks.iter().map(|c| c.as_ref().map_or(0, |b| b.len())).sum(),
            );
            for chunk in entry.chunks.into_iter().flatten() {
                full.extend_from_slice(&chunk);
            }

            self.stats.frames_completed.fetch_add(1, Ordering::Relaxed);
            debug!(frame_id = header.frame_id, bytes = full.len(), "frame reassembled");

            if self.out.try_send((header.frame_id, full.freeze())).is_err() {
                self.stats
                    .frames_dropped_downstream
                    .fetch_add(1, Ordering::Relaxed);
                warn!(frame_id = header.frame_id, "downstream queue full, frame dropped");
            }
        }
    }

    /// Evicts reassembly entries older than the timeout, plus the retired
    /// ids whose duplicate window has passed.
    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let timeout = self.config.reassembly_timeout;

        let expired: Vec<u32> = self
            .frames
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.started_at) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            self.frames.remove(&id);
            self.received.remove(&id);
            self.stats.frames_expired.fetch_add(1, Ordering::Relaxed);
            warn!(frame_id = id, "reassembly timeout, frame discarded");
        }

        self.retired
            .retain(|_, completed_at| now.duration_since(*completed_at) <= timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_receiver(
        config: UdpReceiverConfig,
    ) -> (
        SocketAddr,
        mpsc::Receiver<(u32, Bytes)>,
        Arc<ProtocolControl>,
        Arc<UdpReceiverStats>,
        UdpSocket,
    ) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(64);
        let control = Arc::new(ProtocolControl::new());
        let receiver = UdpReceiver::new(socket, tx, Arc::clone(&control), config);
        let stats = receiver.stats();
        tokio::spawn(receiver.run());

        let producer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        producer.connect(addr).await.unwrap();
        (addr, rx, control, stats, producer)
    }

    #[tokio::test]
    async fn test_reassembles_out_of_order_chunks() {
        let (_, mut rx, control, _, producer) =
            spawn_receiver(UdpReceiverConfig::default()).await;

        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let mut chunks = crate::sender::split_frame(7, &payload);
        chunks.reverse();
        for (_, _, packet) in &chunks {
            producer.send(packet).await.unwrap();
        }

        let (frame_id, frame) = rx.recv().await.unwrap();
        assert_eq!(frame_id, 7);
        assert_eq!(&frame[..], &payload[..]);
        control.abort();
    }

    #[tokio::test]
    async fn test_acks_every_chunk_and_ignores_duplicates() {
        let (_, mut rx, control, stats, producer) =
            spawn_receiver(UdpReceiverConfig::default()).await;

        let payload = vec![9u8; 2900];
        let chunks = crate::sender::split_frame(1, &payload);
        let n = chunks.len() as u64;

        for (_, _, packet) in &chunks {
            producer.send(packet).await.unwrap();
        }
        // Retransmit everything once, as if every ACK was lost.
        for (_, _, packet) in &chunks {
            producer.send(packet).await.unwrap();
        }

        let (frame_id, frame) = rx.recv().await.unwrap();
        assert_eq!(frame_id, 1);
        assert_eq!(frame.len(), payload.len());

        // Every datagram is ACKed, duplicates included.
        let mut ack_buf = [0u8; 16];
        for _ in 0..2 * n {
            let len = producer.recv(&mut ack_buf).await.unwrap();
            assert!(wire::decode_udp_ack(&ack_buf[..len]).is_some());
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(stats.duplicates.load(Ordering::Relaxed), n);
        assert_eq!(stats.frames_completed.load(Ordering::Relaxed), 1);
        assert!(rx.try_recv().is_err(), "no duplicate frame downstream");
        control.abort();
    }

    #[tokio::test]
    async fn test_crc_mismatch_is_processed_by_default() {
        let (_, mut rx, control, stats, producer) =
            spawn_receiver(UdpReceiverConfig::default()).await;

        let mut packet = wire::encode_chunk(wire::wall_clock_ms(), 3, 1, 0, b"payload").to_vec();
        // Flip one payload bit; header CRC now disagrees.
        let flip = wire::UDP_HEADER_SIZE;
        packet[flip] ^= 0x01;
        producer.send(&packet).await.unwrap();

        let (frame_id, _) = rx.recv().await.unwrap();
        assert_eq!(frame_id, 3);
        assert_eq!(stats.crc_mismatches.load(Ordering::Relaxed), 1);
        control.abort();
    }

    #[tokio::test]
    async fn test_crc_mismatch_dropped_when_configured() {
        let config = UdpReceiverConfig {
            drop_on_crc_mismatch: true,
            ..UdpReceiverConfig::default()
        };
        let (_, mut rx, control, stats, producer) = spawn_receiver(config).await;

        let mut packet = wire::encode_chunk(wire::wall_clock_ms(), 3, 1, 0, b"payload").to_vec();
        packet[wire::UDP_HEADER_SIZE] ^= 0x01;
        producer.send(&packet).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.crc_mismatches.load(Ordering::Relaxed), 1);
        assert_eq!(stats.acks_sent.load(Ordering::Relaxed), 0);
        control.abort();
    }

    #[tokio::test]
    async fn test_incomplete_frame_expires() {
        let config = UdpReceiverConfig {
            reassembly_timeout: Duration::from_millis(50),
            ..UdpReceiverConfig::default()
        };
        let (_, mut rx, control, stats, producer) = spawn_receiver(config).await;

        // Send only chunk 0 of a 2-chunk frame.
        let payload = vec![5u8; wire::MAX_PAYLOAD_SIZE + 1];
        let chunks = crate::sender::split_frame(11, &payload);
        producer.send(&chunks[0].2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        // Another datagram triggers the sweep.
        let probe = wire::encode_chunk(0, 12, 1, 0, b"x");
        producer.send(&probe).await.unwrap();

        let (frame_id, _) = rx.recv().await.unwrap();
        assert_eq!(frame_id, 12);
        assert_eq!(stats.frames_expired.load(Ordering::Relaxed), 1);
        control.abort();
    }

    #[tokio::test]
    async fn test_malformed_datagram_gets_no_ack() {
        let (_, _rx, control, stats, producer) =
            spawn_receiver(UdpReceiverConfig::default()).await;

        producer.send(b"garbage").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(stats.malformed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.acks_sent.load(Ordering::Relaxed), 0);
        control.abort();
    }

    #[tokio::test]
    async fn test_abort_marks_closed() {
        let (_, _rx, control, _, _producer) =
            spawn_receiver(UdpReceiverConfig::default()).await;
        assert!(!control.is_closed());
        control.abort();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(control.is_closed());
    }
}
