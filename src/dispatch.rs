//! Ordered frame dispatcher
//!
//! Sits between the reassembler and the codec/fan-out stages. Input is
//! `(frame_id, payload)` in arbitrary order; output is the same pairs in
//! strictly increasing frame-id order. A missing frame is waited for up to
//! a bound, then skipped: viewers tolerate a short delay but reject
//! reordering, and H.264 decoding requires monotonic presentation order.
//!
//! Frame ids are 24-bit and wrap; internally every id is expanded to a
//! monotonically comparable 64-bit sequence so the "expected < min(buffer)"
//! test stays correct across the wrap.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::wire::{seq_less, FRAME_ID_MODULUS};

const FRAME_ID_MASK: u64 = (FRAME_ID_MODULUS - 1) as u64;
// Expansion starts one modulus in so early out-of-order ids cannot
// underflow below zero.
const EXPAND_BIAS: u64 = FRAME_ID_MODULUS as u64;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bounded wait for the expected frame.
    pub timeout: Duration,
    /// Input poll interval inside the wait.
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(400),
            poll_interval: Duration::from_millis(30),
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    pub frames_dispatched: AtomicU64,
    pub timeout_skips: AtomicU64,
    pub late_drops: AtomicU64,
    pub duplicates: AtomicU64,
    pub output_drops: AtomicU64,
}

/// Externally armed reset flag. The session controller arms it during
/// RESET and waits for the dispatcher to clear it.
#[derive(Debug, Clone, Default)]
pub struct DispatchReset(Arc<AtomicBool>);

impl DispatchReset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Expands wrapping 24-bit frame ids into a monotone 64-bit sequence.
///
/// The nearest interpretation to the newest id seen wins: an id within
/// half the modulus ahead of the reference extends forward, anything else
/// is read as behind it.
#[derive(Debug, Default)]
struct SeqExpander {
    last: Option<u64>,
}

impl SeqExpander {
    fn expand(&mut self, id: u32) -> u64 {
        let id = id & (FRAME_ID_MODULUS - 1);
        let expanded = match self.last {
            None => EXPAND_BIAS + id as u64,
            Some(prev) => {
                let prev_low = (prev & FRAME_ID_MASK) as u32;
                let forward = id.wrapping_sub(prev_low) & (FRAME_ID_MODULUS - 1);
                if id == prev_low {
                    prev
                } else if seq_less(prev_low, id) {
                    prev + forward as u64
                } else {
                    prev - (FRAME_ID_MODULUS - forward) as u64
                }
            }
        };
        if self.last.map_or(true, |prev| expanded > prev) {
            self.last = Some(expanded);
        }
        expanded
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// The reordering stage. Owns its buffer; runs as one task.
pub struct OrderedDispatcher {
    input: mpsc::Receiver<(u32, Bytes)>,
    output: mpsc::Sender<(u32, Bytes)>,
    reset: DispatchReset,
    config: DispatchConfig,
    stats: Arc<DispatchStats>,

    buffer: BTreeMap<u64, Bytes>,
    expander: SeqExpander,
    expected: Option<u64>,
}

impl OrderedDispatcher {
    pub fn new(
        input: mpsc::Receiver<(u32, Bytes)>,
        output: mpsc::Sender<(u32, Bytes)>,
        reset: DispatchReset,
        config: DispatchConfig,
    ) -> Self {
        Self {
            input,
            output,
            reset,
            config,
            stats: Arc::new(DispatchStats::default()),
            buffer: BTreeMap::new(),
            expander: SeqExpander::default(),
            expected: None,
        }
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until the input channel closes and the buffer drains.
    pub async fn run(mut self) {
        loop {
            if self.reset.take() {
                self.apply_reset();
                continue;
            }

            let open = self.drain_input();

            // Lazily initialize to the first frame id observed.
            if self.expected.is_none() {
                if let Some((&first, _)) = self.buffer.first_key_value() {
                    self.expected = Some(first);
                }
            }
            let Some(mut expected) = self.expected else {
                if !open {
                    break;
                }
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            };

            self.drop_outdated(expected);

            // Bounded wait for the expected frame.
            let mut waited = Duration::ZERO;
            let mut found = self.buffer.contains_key(&expected);
            while !found && waited < self.config.timeout && !self.reset.is_armed() {
                tokio::time::sleep(self.config.poll_interval).await;
                waited += self.config.poll_interval;
                self.drain_input();
                found = self.buffer.contains_key(&expected);
            }
            if self.reset.is_armed() {
                continue;
            }

            if found {
                while let Some(payload) = self.buffer.remove(&expected) {
                    let frame_id = (expected & FRAME_ID_MASK) as u32;
                    if self.output.try_send((frame_id, payload)).is_err() {
                        self.stats.output_drops.fetch_add(1, Ordering::Relaxed);
                        warn!(frame_id, "dispatch output full, frame dropped");
                    } else {
                        self.stats.frames_dispatched.fetch_add(1, Ordering::Relaxed);
                    }
                    expected += 1;
                }
                self.expected = Some(expected);
            } else if let Some((&next, _)) = self.buffer.first_key_value() {
                self.stats.timeout_skips.fetch_add(1, Ordering::Relaxed);
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    expected = expected & FRAME_ID_MASK,
                    next = next & FRAME_ID_MASK,
                    "timeout waiting for frame, skipping"
                );
                self.expected = Some(next);
            } else if !open {
                // Nothing buffered and the feed is gone.
                break;
            }

            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        debug!(
            dispatched = self.stats.frames_dispatched.load(Ordering::Relaxed),
            skips = self.stats.timeout_skips.load(Ordering::Relaxed),
            "ordered dispatcher stopped"
        );
    }

    /// Moves everything available on the input into the buffer. Returns
    /// false once the input channel is closed.
    fn drain_input(&mut self) -> bool {
        loop {
            match self.input.try_recv() {
                Ok((frame_id, payload)) => {
                    let key = self.expander.expand(frame_id);
                    if self.buffer.contains_key(&key) {
                        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    self.buffer.insert(key, payload);
                }
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Late-late frames: anything behind the expected id is unusable.
    fn drop_outdated(&mut self, expected: u64) {
        while let Some((&first, _)) = self.buffer.first_key_value() {
            if first >= expected {
                break;
            }
            self.buffer.remove(&first);
            self.stats.late_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn apply_reset(&mut self) {
        self.buffer.clear();
        self.expander.reset();
        self.expected = None;
        info!("dispatcher state reset");
    }
}
