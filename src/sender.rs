//! Producer-side reliable chunk sender
//!
//! A selective-repeat ARQ tuned for low-latency video: chunks are
//! retransmitted on a timer until acknowledged, but the window is small and
//! the server side gives up on a frame after a few hundred milliseconds, so
//! retransmission reduces frame loss without ever blocking fresh data.
//!
//! All sender state (send queue, pending window, timer heap) is owned by a
//! single task; ACK intake, window filling, retransmission, and heap
//! compaction are arms of one `select!` loop. Heap entries are lazily
//! deleted: an ACK only removes the pending entry, and stale heap entries
//! are skipped on pop. Periodic compaction rebuilds the heap so it does not
//! grow with the total number of chunks ever sent.

use bytes::Bytes;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::wire;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sender task is gone")]
    Closed,
}

/// Timing knobs for the sender loop.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum in-flight (unacknowledged) chunks.
    pub window_size: usize,
    /// Retransmit a chunk this long after its last send, milliseconds.
    pub retransmit_timeout_ms: u64,
    /// Window-filler pass interval, milliseconds.
    pub window_tick_ms: u64,
    /// Retransmitter pass interval, milliseconds.
    pub retransmit_tick_ms: u64,
    /// Timer-heap compaction interval, seconds.
    pub compact_interval_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            window_size: 30,
            retransmit_timeout_ms: 100,
            window_tick_ms: 15,
            retransmit_tick_ms: 10,
            compact_interval_secs: 30,
        }
    }
}

/// Lock-free counters for monitoring the sender.
#[derive(Debug, Default)]
pub struct SenderStats {
    pub chunks_enqueued: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub retransmits: AtomicU64,
    pub acks_received: AtomicU64,
    pub stale_acks: AtomicU64,
    /// Current pending-window occupancy (gauge, <= window_size).
    pub in_flight: AtomicUsize,
}

enum Cmd {
    Chunks(Vec<(u32, u8, Bytes)>),
    Shutdown,
}

/// Cloneable feed into the sender task.
#[derive(Clone)]
pub struct SenderHandle {
    tx: mpsc::Sender<Cmd>,
    stats: Arc<SenderStats>,
}

impl SenderHandle {
    /// Fragments `payload` into headered chunks and queues them for
    /// transmission. Non-blocking from the caller's point of view apart
    /// from channel backpressure.
    pub async fn send_frame(&self, frame_id: u32, payload: &[u8]) -> Result<(), SenderError> {
        let chunks = split_frame(frame_id, payload);
        self.stats
            .chunks_enqueued
            .fetch_add(chunks.len() as u64, Ordering::Relaxed);
        self.tx
            .send(Cmd::Chunks(chunks))
            .await
            .map_err(|_| SenderError::Closed)
    }

    /// Stops the sender task; anything still pending is abandoned.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Cmd::Shutdown).await;
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }
}

/// Fragments one encoded frame into wire chunks.
pub fn split_frame(frame_id: u32, payload: &[u8]) -> Vec<(u32, u8, Bytes)> {
    let timestamp_ms = wire::wall_clock_ms();
    let total = payload.len().div_ceil(wire::MAX_PAYLOAD_SIZE).max(1);
    debug_assert!(total <= u8::MAX as usize, "frame exceeds 255 chunks");

    let mut chunks = Vec::with_capacity(total);
    for (index, piece) in payload.chunks(wire::MAX_PAYLOAD_SIZE).enumerate() {
        let packet = wire::encode_chunk(timestamp_ms, frame_id, total as u8, index as u8, piece);
        chunks.push((frame_id, index as u8, packet));
    }
    if payload.is_empty() {
        chunks.push((frame_id, 0, wire::encode_chunk(timestamp_ms, frame_id, 1, 0, &[])));
    }
    chunks
}

struct PendingChunk {
    packet: Bytes,
    last_send_ms: u64,
}

/// The sender task. Owns the socket and all window state.
pub struct ReliableSender {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    config: SenderConfig,
    stats: Arc<SenderStats>,

    rx: mpsc::Receiver<Cmd>,
    send_queue: VecDeque<(u32, u8, Bytes)>,
    pending: HashMap<(u32, u8), PendingChunk>,
    // (next_retransmit_ms, frame_id, chunk_index); stale entries skipped on pop
    heap: BinaryHeap<Reverse<(u64, u32, u8)>>,
    epoch: Instant,
}

impl ReliableSender {
    pub fn new(
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
        config: SenderConfig,
    ) -> (Self, SenderHandle) {
        let stats = Arc::new(SenderStats::default());
        let (tx, rx) = mpsc::channel(256);
        let sender = Self {
            socket,
            dest,
            config,
            stats: Arc::clone(&stats),
            rx,
            send_queue: VecDeque::new(),
            pending: HashMap::new(),
            heap: BinaryHeap::new(),
            epoch: Instant::now(),
        };
        (sender, SenderHandle { tx, stats })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Runs until shutdown. The four duties of the sender share this one
    /// loop, so the window state needs no locking.
    pub async fn run(mut self) {
        let mut window_tick = tokio::time::interval(Duration::from_millis(self.config.window_tick_ms));
        let mut rto_tick =
            tokio::time::interval(Duration::from_millis(self.config.retransmit_tick_ms));
        let mut compact_tick =
            tokio::time::interval(Duration::from_secs(self.config.compact_interval_secs));
        let mut ack_buf = [0u8; 64];

        debug!(dest = %self.dest, window = self.config.window_size, "reliable sender started");

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(Cmd::Chunks(chunks)) => self.send_queue.extend(chunks),
                    Some(Cmd::Shutdown) | None => break,
                },
                _ = window_tick.tick() => {
                    if let Err(e) = self.fill_window().await {
                        warn!(error = %e, "window fill failed");
                    }
                }
                _ = rto_tick.tick() => {
                    if let Err(e) = self.retransmit_due().await {
                        warn!(error = %e, "retransmit pass failed");
                    }
                }
                _ = compact_tick.tick() => self.compact_heap(),
                result = self.socket.recv_from(&mut ack_buf) => {
                    if let Ok((len, _addr)) = result {
                        self.handle_ack(&ack_buf[..len]);
                    }
                }
            }
        }

        debug!(
            sent = self.stats.chunks_sent.load(Ordering::Relaxed),
            retransmits = self.stats.retransmits.load(Ordering::Relaxed),
            "reliable sender stopped"
        );
    }

    /// Transmits queued chunks while the pending window has room.
    async fn fill_window(&mut self) -> Result<(), SenderError> {
        while self.pending.len() < self.config.window_size {
            let Some((frame_id, chunk_index, packet)) = self.send_queue.pop_front() else {
                break;
            };
            self.socket.send_to(&packet, self.dest).await?;
            let now = self.now_ms();
            self.pending.insert(
                (frame_id, chunk_index),
                PendingChunk {
                    packet,
                    last_send_ms: now,
                },
            );
            self.heap.push(Reverse((
                now + self.config.retransmit_timeout_ms,
                frame_id,
                chunk_index,
            )));
            self.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
            self.stats
                .in_flight
                .store(self.pending.len(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Resends every pending chunk whose timer expired; reschedules it.
    async fn retransmit_due(&mut self) -> Result<(), SenderError> {
        let now = self.now_ms();
        while let Some(&Reverse((due, frame_id, chunk_index))) = self.heap.peek() {
            if due > now {
                break;
            }
            self.heap.pop();
            let key = (frame_id, chunk_index);
            let Some(entry) = self.pending.get_mut(&key) else {
                // ACKed since it was scheduled; lazy deletion.
                continue;
            };
            trace!(
                frame_id,
                chunk_index,
                elapsed_ms = now - entry.last_send_ms,
                "retransmit"
            );
            self.socket.send_to(&entry.packet, self.dest).await?;
            entry.last_send_ms = now;
            self.heap.push(Reverse((
                now + self.config.retransmit_timeout_ms,
                frame_id,
                chunk_index,
            )));
            self.stats.retransmits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Rebuilds the heap from entries still pending. Without this the heap
    /// grows with every chunk ever sent.
    fn compact_heap(&mut self) {
        let before = self.heap.len();
        let retained: Vec<_> = self
            .heap
            .drain()
            .filter(|Reverse((_, fid, idx))| self.pending.contains_key(&(*fid, *idx)))
            .collect();
        self.heap = retained.into_iter().collect();
        debug!(before, after = self.heap.len(), "timer heap compacted");
    }

    /// Removes the matching pending entry. ACKs for unknown keys are
    /// no-ops (duplicate ACK, or the chunk was already released).
    fn handle_ack(&mut self, data: &[u8]) {
        let Some((frame_id, chunk_index)) = wire::decode_udp_ack(data) else {
            trace!(len = data.len(), "non-ACK datagram on sender socket");
            return;
        };
        if self.pending.remove(&(frame_id, chunk_index)).is_some() {
            self.stats.acks_received.fetch_add(1, Ordering::Relaxed);
            self.stats
                .in_flight
                .store(self.pending.len(), Ordering::Relaxed);
        } else {
            self.stats.stale_acks.fetch_add(1, Ordering::Relaxed);
        }
    }
}
