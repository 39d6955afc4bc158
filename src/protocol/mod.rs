//! Ingest protocol implementations
//!
//! One protocol instance is live per session: chunked UDP with per-chunk
//! ACKs and reassembly, or framed TCP with one packet per frame. Both emit
//! `(frame_id, payload)` pairs downstream and share the lifecycle contract
//! in [`ProtocolControl`].

pub mod tcp;
pub mod udp;

pub use tcp::TcpReceiver;
pub use udp::UdpReceiver;

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle handle shared between a protocol task and the session
/// controller.
///
/// `stop()` makes the receive loop discard further input; `abort()` makes
/// the task exit, after which it flips `closed`. The controller waits on
/// `closed` before rebinding the port. The abort signal is level-triggered
/// (a `watch` channel), so a task that subscribes late still sees it.
#[derive(Debug)]
pub struct ProtocolControl {
    stopped: AtomicBool,
    closed: AtomicBool,
    connected: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for ProtocolControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolControl {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Stop accepting input; the socket stays bound until `abort()`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Ask the protocol task to exit.
    pub fn abort(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Resolves when (or as soon as) the handle is aborted.
    pub async fn aborted(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        // Err only if the sender is gone, which it is not; we own it.
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claims the single client slot. False if a client is already live.
    pub(crate) fn try_connect(&self) -> bool {
        self.connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Re-arms the handle for a fresh bind. Callers must wait for any live
    /// connection to drain first; the connected flag is owned by the
    /// connection task.
    pub fn rearm(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(false);
    }
}

/// Raises the socket receive/send buffers toward `target` bytes.
///
/// On Linux the effective value is clamped by `net.core.{r,w}mem_max`;
/// with the `sysctl-tuning` feature the ceiling is temporarily raised,
/// the buffers applied, and the original value restored. Best effort
/// throughout.
pub(crate) fn tune_socket_buffers(sock: socket2::SockRef<'_>, target: usize) {
    let before_rcv = sock.recv_buffer_size().unwrap_or(0);
    let before_snd = sock.send_buffer_size().unwrap_or(0);

    #[cfg(feature = "sysctl-tuning")]
    let restore = raise_sysctl_ceiling(target);

    if let Err(e) = sock.set_recv_buffer_size(target) {
        warn!(error = %e, "failed to set SO_RCVBUF");
    }
    if let Err(e) = sock.set_send_buffer_size(target) {
        warn!(error = %e, "failed to set SO_SNDBUF");
    }

    #[cfg(feature = "sysctl-tuning")]
    if let Some((rmem, wmem)) = restore {
        restore_sysctl_ceiling(&rmem, &wmem);
    }

    info!(
        rcvbuf_before = before_rcv,
        rcvbuf_after = sock.recv_buffer_size().unwrap_or(0),
        sndbuf_before = before_snd,
        sndbuf_after = sock.send_buffer_size().unwrap_or(0),
        "socket buffers tuned"
    );
}

#[cfg(feature = "sysctl-tuning")]
fn raise_sysctl_ceiling(target: usize) -> Option<(String, String)> {
    fn read(key: &str) -> Option<String> {
        let out = std::process::Command::new("sysctl")
            .args(["-n", key])
            .output()
            .ok()?;
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
    fn write(key: &str, value: &str) -> bool {
        std::process::Command::new("sysctl")
            .arg("-w")
            .arg(format!("{key}={value}"))
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    let rmem = read("net.core.rmem_max")?;
    let wmem = read("net.core.wmem_max")?;
    let target = target.to_string();
    if !write("net.core.rmem_max", &target) || !write("net.core.wmem_max", &target) {
        warn!("failed to raise socket buffer ceilings");
        return None;
    }
    info!(rmem_max = %rmem, wmem_max = %wmem, "raised socket buffer ceilings");
    Some((rmem, wmem))
}

#[cfg(feature = "sysctl-tuning")]
fn restore_sysctl_ceiling(rmem: &str, wmem: &str) {
    for (key, value) in [("net.core.rmem_max", rmem), ("net.core.wmem_max", wmem)] {
        let ok = std::process::Command::new("sysctl")
            .arg("-w")
            .arg(format!("{key}={value}"))
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !ok {
            warn!(key, "failed to restore socket buffer ceiling");
        }
    }
}
