//! Session controller
//!
//! One session is one configured pipeline: a transport listener, the
//! reassembly protocol, the ordering stage (UDP only), the codec and
//! inference stages the variant calls for, and the fan-out hub. The
//! variant space is closed (incoming format x outgoing format x
//! transport x inference) and the controller assembles the matching
//! graph at startup.
//!
//! RESET tears down only the transport and ordering state: stop the
//! protocol, abort the transport, wait for it to close, clear the
//! dispatcher, rebind. Codec tasks and the inference worker keep running,
//! and the subscriber-side freshness filter hides anything stale left in
//! subscriber queues.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::codec::{self, RawFrameSink};
use crate::config::{Config, Format, Transport};
use crate::dispatch::{DispatchConfig, DispatchReset, OrderedDispatcher};
use crate::hub::{FanoutHub, HubConfig};
use crate::inference::{self, InferenceBridge};
use crate::protocol::tcp::TcpReceiverConfig;
use crate::protocol::udp::UdpReceiverConfig;
use crate::protocol::{ProtocolControl, TcpReceiver, UdpReceiver};

/// One cell of the closed 16-way pipeline space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variant {
    pub incoming: Format,
    pub outgoing: Format,
    pub transport: Transport,
    pub inference: bool,
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}->{} (inference {})",
            self.transport,
            self.incoming,
            self.outgoing,
            if self.inference { "on" } else { "off" }
        )
    }
}

impl From<&crate::config::VariantConfig> for Variant {
    fn from(config: &crate::config::VariantConfig) -> Self {
        Self {
            incoming: config.incoming,
            outgoing: config.outgoing,
            transport: config.transport,
            inference: config.inference,
        }
    }
}

#[derive(Default)]
struct SessionState {
    ingest_tx: Option<mpsc::Sender<(u32, Bytes)>>,
    protocol_task: Option<JoinHandle<()>>,
    dispatcher_task: Option<JoinHandle<()>>,
    route_tasks: Vec<JoinHandle<()>>,
    bridge: Option<InferenceBridge>,
    monitor_task: Option<JoinHandle<()>>,
}

/// The session controller. Shared between the pipeline and the control
/// plane; all mutation goes through the internal state lock.
pub struct Session {
    config: Config,
    variant: Variant,
    hub: Arc<FanoutHub>,
    control: Arc<ProtocolControl>,
    dispatch_reset: DispatchReset,
    stream_started: AtomicBool,
    fatal_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let variant = Variant::from(&config.variant);
        let hub = FanoutHub::new(HubConfig {
            freshness: Duration::from_millis(config.tuning.freshness_ms),
            ..HubConfig::default()
        });
        let (fatal_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            variant,
            hub,
            control: Arc::new(ProtocolControl::new()),
            dispatch_reset: DispatchReset::new(),
            stream_started: AtomicBool::new(false),
            fatal_tx,
            shutdown_tx,
            state: Mutex::new(SessionState::default()),
        }))
    }

    pub fn hub(&self) -> Arc<FanoutHub> {
        Arc::clone(&self.hub)
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolves true on a session-fatal condition (inference crash).
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal_tx.subscribe()
    }

    /// Latches the started flag; returns whether this was the first time.
    pub fn mark_stream_started(&self) -> bool {
        !self.stream_started.swap(true, Ordering::SeqCst)
    }

    /// Assembles the pipeline for the configured variant and binds the
    /// ingest listener.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        let (ingest_tx, ingest_rx) = mpsc::channel(256);

        // TCP arrives in order; only UDP needs the reordering stage.
        let route_rx = match self.variant.transport {
            Transport::Udp => {
                let (dispatch_tx, dispatch_rx) = mpsc::channel(256);
                let dispatcher = OrderedDispatcher::new(
                    ingest_rx,
                    dispatch_tx,
                    self.dispatch_reset.clone(),
                    DispatchConfig {
                        timeout: Duration::from_millis(self.config.tuning.dispatch_timeout_ms),
                        poll_interval: Duration::from_millis(self.config.tuning.dispatch_poll_ms),
                    },
                );
                state.dispatcher_task = Some(tokio::spawn(dispatcher.run()));
                dispatch_rx
            }
            Transport::Tcp => ingest_rx,
        };

        self.build_route(&mut state, route_rx)?;

        // Periodic fan-out statistics.
        let hub = Arc::clone(&self.hub);
        state.route_tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            tick.tick().await;
            loop {
                tick.tick().await;
                let stats = hub.stats();
                info!(
                    published = stats.frames_published,
                    dropped_slow = stats.frames_dropped_slow,
                    subscribers = stats.subscribers,
                    "fan-out stats"
                );
            }
        }));

        state.ingest_tx = Some(ingest_tx.clone());
        self.bind_protocol(&mut state, ingest_tx).await?;

        info!(variant = %self.variant, port = self.config.ingest_port(), "session started");
        Ok(())
    }

    /// Wires `route_rx` through the decode/inference/encode stages the
    /// variant needs, ending at the fan-out hub.
    fn build_route(
        &self,
        state: &mut SessionState,
        route_rx: mpsc::Receiver<(u32, Bytes)>,
    ) -> Result<()> {
        let (publish_tx, mut publish_rx) = mpsc::channel::<(u32, Bytes)>(64);

        let hub = Arc::clone(&self.hub);
        state.route_tasks.push(tokio::spawn(async move {
            while let Some((_frame_id, payload)) = publish_rx.recv().await {
                hub.publish(payload);
                tokio::task::yield_now().await;
            }
        }));

        let variant = self.variant;
        let codec_config = self.config.codec.clone();

        // Same format in and out, no inference: the validated payload is
        // forwarded untouched.
        if !variant.inference && variant.incoming == variant.outgoing {
            let mut rx = route_rx;
            state.route_tasks.push(tokio::spawn(async move {
                while let Some(pair) = rx.recv().await {
                    if publish_tx.send(pair).await.is_err() {
                        break;
                    }
                }
            }));
            return Ok(());
        }

        // Decode side: compressed payloads to raw frames, into either the
        // inference input ring or a plain channel.
        let raw_rx = if variant.inference {
            let mut bridge = InferenceBridge::spawn(&self.config)?;
            let (consumer_tx, consumer_rx) = mpsc::channel(64);
            state
                .route_tasks
                .push(inference::spawn_consumer_task(Arc::clone(&bridge.output), consumer_tx));

            let sink = RawFrameSink::Ring(Arc::clone(&bridge.input));
            state.route_tasks.push(self.spawn_decoder(route_rx, sink, &codec_config));

            self.spawn_worker_monitor(state, &mut bridge);
            state.bridge = Some(bridge);
            consumer_rx
        } else {
            let (raw_tx, raw_rx) = mpsc::channel(64);
            let sink = RawFrameSink::Channel(raw_tx);
            state.route_tasks.push(self.spawn_decoder(route_rx, sink, &codec_config));
            raw_rx
        };

        // Encode side: raw frames to the outgoing payload format.
        let encode_task = match variant.outgoing {
            Format::Jpg => codec::spawn_jpeg_encode_task(
                codec_config.jpeg_quality,
                raw_rx,
                publish_tx,
            ),
            Format::H264 => codec::spawn_encode_task(codec_config, raw_rx, publish_tx),
        };
        state.route_tasks.push(encode_task);
        Ok(())
    }

    fn spawn_decoder(
        &self,
        route_rx: mpsc::Receiver<(u32, Bytes)>,
        sink: RawFrameSink,
        codec_config: &crate::config::CodecConfig,
    ) -> JoinHandle<()> {
        match self.variant.incoming {
            Format::Jpg => codec::spawn_jpeg_decode_task(route_rx, sink),
            Format::H264 => {
                codec::spawn_decode_task(codec_config.hw_device.clone(), route_rx, sink)
            }
        }
    }

    /// Supervises the worker process: an unexpected exit is session-fatal;
    /// on session shutdown it delivers the SIGKILL and reaps.
    fn spawn_worker_monitor(&self, state: &mut SessionState, bridge: &mut InferenceBridge) {
        let Some(mut child) = bridge.take_child() else {
            return;
        };
        let fatal_tx = self.fatal_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        state.monitor_task = Some(tokio::spawn(async move {
            let exited = tokio::select! {
                _ = shutdown_rx.wait_for(|stopping| *stopping) => None,
                status = child.wait() => Some(status),
            };
            match exited {
                Some(status) => {
                    error!(
                        status = ?status.ok(),
                        "inference worker exited unexpectedly; session is fatal"
                    );
                    fatal_tx.send_replace(true);
                }
                None => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    info!("inference worker killed and reaped");
                }
            }
        }));
    }

    async fn bind_protocol(
        &self,
        state: &mut SessionState,
        ingest_tx: mpsc::Sender<(u32, Bytes)>,
    ) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.config.server.bind_ip,
            self.config.ingest_port()
        );
        match self.variant.transport {
            Transport::Udp => {
                let socket = UdpSocket::bind(&addr)
                    .await
                    .with_context(|| format!("failed to bind UDP {addr}"))?;
                let receiver = UdpReceiver::new(
                    socket,
                    ingest_tx,
                    Arc::clone(&self.control),
                    UdpReceiverConfig {
                        reassembly_timeout: Duration::from_millis(
                            self.config.tuning.reassembly_timeout_ms,
                        ),
                        drop_on_crc_mismatch: self.config.tuning.drop_on_crc_mismatch,
                        socket_buffer_bytes: self.config.tuning.socket_buffer_bytes,
                    },
                );
                state.protocol_task = Some(tokio::spawn(receiver.run()));
            }
            Transport::Tcp => {
                let listener = TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("failed to bind TCP {addr}"))?;
                let receiver = TcpReceiver::new(
                    listener,
                    ingest_tx,
                    Arc::clone(&self.control),
                    TcpReceiverConfig {
                        socket_buffer_bytes: self.config.tuning.socket_buffer_bytes,
                        ..TcpReceiverConfig::default()
                    },
                );
                state.protocol_task = Some(tokio::spawn(receiver.run()));
            }
        }
        Ok(())
    }

    /// RESET: stop the protocol, abort the transport, wait for it to
    /// close, clear the ordering state, and rebind. Codec tasks and the
    /// inference worker are left running; no state from the previous
    /// stream can reach the next stream's output.
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        info!("stream reset requested");

        if let Some(task) = state.protocol_task.take() {
            self.control.stop();
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.control.abort();
            if task.await.is_err() {
                warn!("protocol task ended abnormally during reset");
            }
            while !self.control.is_closed() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            // A live TCP connection runs on its own task; it must observe
            // the abort and release the client slot before the re-arm.
            while self.control.is_connected() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            if self.variant.transport == Transport::Udp {
                self.dispatch_reset.arm();
                while self.dispatch_reset.is_armed() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        self.control.rearm();

        let ingest_tx = state
            .ingest_tx
            .clone()
            .context("session was never started")?;
        self.bind_protocol(&mut state, ingest_tx).await?;
        info!("stream reset complete, listener rebound");
        Ok(())
    }

    /// Full teardown. Every step is guarded so one failure does not stop
    /// the rest of the ladder.
    pub async fn shutdown(&self) {
        info!("cleaning up session");
        let mut state = self.state.lock().await;

        // Stop the protocol, abort the transport, wait for close.
        self.control.stop();
        self.control.abort();
        if let Some(task) = state.protocol_task.take() {
            if task.await.is_err() {
                warn!("protocol task ended abnormally");
            }
        }

        // Closing the ingest feed lets the dispatcher drain and exit.
        state.ingest_tx = None;
        if let Some(task) = state.dispatcher_task.take() {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("dispatcher did not drain in time");
            }
        }

        // Kill and reap the inference worker before its rings vanish.
        self.shutdown_tx.send_replace(true);
        if let Some(task) = state.monitor_task.take() {
            if task.await.is_err() {
                warn!("worker monitor ended abnormally");
            }
        }

        // Stop and unlink the shared rings; wakes any blocked ring I/O.
        if let Some(mut bridge) = state.bridge.take() {
            bridge.shutdown().await;
        }

        // Codec and routing tasks exit as their inputs close.
        for mut task in state.route_tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        info!("session cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariantConfig;

    #[test]
    fn test_variant_display() {
        let variant = Variant::from(&VariantConfig {
            incoming: Format::H264,
            outgoing: Format::Jpg,
            transport: Transport::Udp,
            inference: false,
        });
        assert_eq!(variant.to_string(), "UDP H264->JPG (inference off)");
    }

    #[tokio::test]
    async fn test_passthrough_session_reaches_hub() {
        // JPG -> JPG over TCP without inference forwards payloads as-is.
        let mut config = Config::default();
        config.variant = VariantConfig {
            incoming: Format::Jpg,
            outgoing: Format::Jpg,
            transport: Transport::Tcp,
            inference: false,
        };
        // Ephemeral port so tests do not collide.
        config.server.tcp_port_jpg = 0;

        let session = Session::new(config).unwrap();
        session.start().await.unwrap();

        let hub = session.hub();
        let mut subscriber = hub.subscribe();

        // Inject downstream of the transport, through the route.
        let state = session.state.lock().await;
        let ingest = state.ingest_tx.clone().unwrap();
        drop(state);
        ingest.send((1, Bytes::from_static(b"jpeg-bytes"))).await.unwrap();

        let frame = subscriber.recv().await.unwrap();
        assert_eq!(&frame.payload[..], b"jpeg-bytes");

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_time_latch() {
        let mut config = Config::default();
        config.variant.transport = Transport::Tcp;
        config.variant.inference = false;
        let session = Session::new(config).unwrap();
        assert!(session.mark_stream_started());
        assert!(!session.mark_stream_started());
    }
}
