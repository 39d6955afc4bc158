//! Fan-out hub: one frame stream, many subscriber queues
//!
//! Each subscriber gets its own bounded FIFO. Publishing never blocks: a
//! full queue means that subscriber skips the frame (its feed freezes for
//! a moment, then catches up on the next one). Every queued frame carries
//! its enqueue time; subscribers drop frames older than the freshness
//! bound so a reconnect or network pause never replays stale video.
//!
//! Subscribe/unsubscribe and publish all run on the event loop; the
//! registry lock is held only for the queue handoff.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-subscriber queue depth.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_capacity: usize,
    /// Subscribers skip frames older than this.
    pub freshness: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: SUBSCRIBER_QUEUE_CAPACITY,
            freshness: Duration::from_millis(200),
        }
    }
}

/// A frame as it sits in a subscriber queue.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub enqueued_at: Instant,
    pub payload: Bytes,
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::Sender<QueuedFrame>,
    dropped: Arc<AtomicU64>,
}

/// Snapshot of hub counters.
#[derive(Debug, Clone)]
pub struct HubStats {
    pub frames_published: u64,
    pub frames_dropped_slow: u64,
    pub subscribers: usize,
}

/// The hub. Cheap to share; publish is non-blocking.
pub struct FanoutHub {
    config: HubConfig,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
    frames_published: AtomicU64,
    frames_dropped_slow: AtomicU64,
}

impl FanoutHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            frames_published: AtomicU64::new(0),
            frames_dropped_slow: AtomicU64::new(0),
        })
    }

    /// Registers a new subscriber queue.
    pub fn subscribe(self: &Arc<Self>) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().push(SubscriberEntry {
            id,
            tx,
            dropped: Arc::clone(&dropped),
        });
        info!(subscriber = id, total = self.subscriber_count(), "subscriber added");
        Subscriber {
            id,
            rx,
            dropped,
            freshness: self.config.freshness,
            hub: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|entry| entry.id != id);
        info!(subscriber = id, total = subscribers.len(), "subscriber removed");
    }

    /// Delivers `payload` to every subscriber queue that has room.
    /// Returns the number of queues that accepted the frame.
    pub fn publish(&self, payload: Bytes) -> usize {
        let frame = QueuedFrame {
            enqueued_at: Instant::now(),
            payload,
        };
        self.frames_published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut gone = false;
        {
            let subscribers = self.subscribers.lock();
            for entry in subscribers.iter() {
                match entry.tx.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        entry.dropped.fetch_add(1, Ordering::Relaxed);
                        self.frames_dropped_slow.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => gone = true,
                }
            }
        }
        if gone {
            // Handlers normally remove themselves; this catches queues
            // whose receiver vanished without unsubscribing.
            self.subscribers.lock().retain(|e| !e.tx.is_closed());
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_dropped_slow: self.frames_dropped_slow.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// One subscriber's end of its queue. Unsubscribes itself on drop.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<QueuedFrame>,
    dropped: Arc<AtomicU64>,
    freshness: Duration,
    hub: Arc<FanoutHub>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Frames this subscriber missed because its queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Next queued frame, stale or not. `None` when the hub is gone.
    pub async fn recv(&mut self) -> Option<QueuedFrame> {
        self.rx.recv().await
    }

    /// Next frame younger than the freshness bound; skips stale ones.
    pub async fn recv_fresh(&mut self) -> Option<Bytes> {
        while let Some(frame) = self.rx.recv().await {
            let age = frame.enqueued_at.elapsed();
            if age > self.freshness {
                warn!(
                    subscriber = self.id,
                    age_ms = age.as_millis() as u64,
                    "skipped stale frame"
                );
                continue;
            }
            return Some(frame.payload);
        }
        None
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        debug!(subscriber = self.id, "subscriber handle dropped");
        self.hub.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_with(capacity: usize, freshness_ms: u64) -> Arc<FanoutHub> {
        FanoutHub::new(HubConfig {
            queue_capacity: capacity,
            freshness: Duration::from_millis(freshness_ms),
        })
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let hub = hub_with(8, 1000);
        let mut sub1 = hub.subscribe();
        let mut sub2 = hub.subscribe();

        let delivered = hub.publish(Bytes::from_static(b"frame"));
        assert_eq!(delivered, 2);

        assert_eq!(&sub1.recv().await.unwrap().payload[..], b"frame");
        assert_eq!(&sub2.recv().await.unwrap().payload[..], b"frame");
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking_fast() {
        let hub = hub_with(2, 10_000);
        let mut fast = hub.subscribe();
        let slow = hub.subscribe();

        for n in 0..10u8 {
            hub.publish(Bytes::from(vec![n]));
            // Fast consumer keeps up.
            assert_eq!(fast.recv().await.unwrap().payload[0], n);
        }

        // The slow queue holds its capacity; the rest were dropped for it.
        assert_eq!(slow.dropped_count(), 8);
        assert_eq!(hub.stats().frames_dropped_slow, 8);
        assert_eq!(hub.stats().frames_published, 10);
    }

    #[tokio::test]
    async fn test_stale_frames_filtered() {
        let hub = hub_with(8, 30);
        let mut sub = hub.subscribe();

        hub.publish(Bytes::from_static(b"stale"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        hub.publish(Bytes::from_static(b"fresh"));

        let got = sub.recv_fresh().await.unwrap();
        assert_eq!(&got[..], b"fresh");
    }

    #[test]
    fn test_unsubscribe_on_drop() {
        tokio_test::block_on(async {
            let hub = hub_with(8, 1000);
            {
                let _sub = hub.subscribe();
                assert_eq!(hub.subscriber_count(), 1);
            }
            assert_eq!(hub.subscriber_count(), 0);
            // Publishing into an empty hub is a no-op.
            assert_eq!(hub.publish(Bytes::from_static(b"x")), 0);
        });
    }
}
