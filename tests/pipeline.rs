//! End-to-end pipeline tests over loopback sockets
//!
//! These drive real UDP/TCP transports through the reassembler, the
//! ordered dispatcher, and the session graph, at reduced scale.

use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use framelink::codec::RawFrame;
use framelink::config::{Config, Format, Transport, VariantConfig};
use framelink::dispatch::{DispatchConfig, DispatchReset, OrderedDispatcher};
use framelink::producer::{self, ProduceOptions};
use framelink::protocol::udp::{UdpReceiver, UdpReceiverConfig};
use framelink::protocol::ProtocolControl;
use framelink::sender::{split_frame, ReliableSender, SenderConfig};
use framelink::session::Session;
use framelink::shm::{FrameShape, ShmRing};
use framelink::wire;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// Payload whose content names its frame, so ordering and residue checks
/// can read ids back out of the bytes.
fn tagged_payload(frame_id: u32, chunks: usize) -> Vec<u8> {
    let mut payload = vec![0u8; wire::MAX_PAYLOAD_SIZE * (chunks - 1) + 100];
    payload[..4].copy_from_slice(&frame_id.to_be_bytes());
    payload
}

fn tag_of(payload: &[u8]) -> u32 {
    u32::from_be_bytes(payload[..4].try_into().unwrap())
}

struct UdpHarness {
    server_addr: std::net::SocketAddr,
    ordered_rx: mpsc::Receiver<(u32, Bytes)>,
    control: Arc<ProtocolControl>,
    receiver_stats: Arc<framelink::protocol::udp::UdpReceiverStats>,
    dispatch_stats: Arc<framelink::dispatch::DispatchStats>,
}

/// Reassembler feeding an ordered dispatcher, both on real sockets.
async fn spawn_udp_pipeline(reassembly_timeout_ms: u64, dispatch_timeout_ms: u64) -> UdpHarness {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = socket.local_addr().unwrap();

    let (ingest_tx, ingest_rx) = mpsc::channel(1024);
    let (ordered_tx, ordered_rx) = mpsc::channel(1024);

    let control = Arc::new(ProtocolControl::new());
    let receiver = UdpReceiver::new(
        socket,
        ingest_tx,
        Arc::clone(&control),
        UdpReceiverConfig {
            reassembly_timeout: Duration::from_millis(reassembly_timeout_ms),
            ..UdpReceiverConfig::default()
        },
    );
    let receiver_stats = receiver.stats();
    tokio::spawn(receiver.run());

    let dispatcher = OrderedDispatcher::new(
        ingest_rx,
        ordered_tx,
        DispatchReset::new(),
        DispatchConfig {
            timeout: Duration::from_millis(dispatch_timeout_ms),
            poll_interval: Duration::from_millis(10),
        },
    );
    let dispatch_stats = dispatcher.stats();
    tokio::spawn(dispatcher.run());

    UdpHarness {
        server_addr,
        ordered_rx,
        control,
        receiver_stats,
        dispatch_stats,
    }
}

#[tokio::test]
async fn clean_run_delivers_in_order_with_every_chunk_acked() {
    const FRAMES: u32 = 40;
    const CHUNKS: usize = 3;

    let mut harness = spawn_udp_pipeline(500, 400).await;

    // Real ARQ sender; ACKs release the window.
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let (sender, handle) = ReliableSender::new(
        Arc::clone(&socket),
        harness.server_addr,
        SenderConfig::default(),
    );
    let sender_task = tokio::spawn(sender.run());

    for frame_id in 0..FRAMES {
        handle
            .send_frame(frame_id, &tagged_payload(frame_id, CHUNKS))
            .await
            .unwrap();
    }

    for expected in 0..FRAMES {
        let (frame_id, payload) =
            tokio::time::timeout(Duration::from_secs(5), harness.ordered_rx.recv())
                .await
                .expect("frame within deadline")
                .expect("stream open");
        assert_eq!(frame_id, expected);
        assert_eq!(tag_of(&payload), expected);
    }

    // Every chunk was acknowledged; none expired.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while handle.stats().acks_received.load(Ordering::Relaxed) < (FRAMES as u64 * CHUNKS as u64)
        && std::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        handle.stats().acks_received.load(Ordering::Relaxed),
        FRAMES as u64 * CHUNKS as u64
    );
    // At least one ACK per chunk; a loaded host may retransmit and re-ACK.
    assert!(
        harness.receiver_stats.acks_sent.load(Ordering::Relaxed)
            >= FRAMES as u64 * CHUNKS as u64
    );
    assert_eq!(harness.receiver_stats.frames_expired.load(Ordering::Relaxed), 0);
    assert_eq!(harness.dispatch_stats.timeout_skips.load(Ordering::Relaxed), 0);

    handle.shutdown().await;
    sender_task.await.unwrap();
    harness.control.abort();
}

#[tokio::test]
async fn reversed_chunks_and_interleaved_frames_still_order() {
    const FRAMES: u32 = 6;
    const CHUNKS: usize = 4;

    let mut harness = spawn_udp_pipeline(500, 400).await;
    let producer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    producer.connect(harness.server_addr).await.unwrap();

    // Chunks reversed within each frame, frames interleaved round-robin.
    let per_frame: Vec<Vec<(u32, u8, Bytes)>> = (0..FRAMES)
        .map(|frame_id| {
            let mut chunks = split_frame(frame_id, &tagged_payload(frame_id, CHUNKS));
            chunks.reverse();
            chunks
        })
        .collect();
    for round in 0..CHUNKS {
        for chunks in &per_frame {
            producer.send(&chunks[round].2).await.unwrap();
        }
    }

    for expected in 0..FRAMES {
        let (frame_id, payload) =
            tokio::time::timeout(Duration::from_secs(5), harness.ordered_rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(frame_id, expected);
        assert_eq!(tag_of(&payload), expected);
    }
    assert_eq!(
        harness.receiver_stats.frames_completed.load(Ordering::Relaxed),
        FRAMES as u64
    );
    harness.control.abort();
}

#[tokio::test]
async fn permanent_chunk_loss_skips_one_frame_only() {
    const FRAMES: u32 = 12;
    const CHUNKS: usize = 4;
    const LOST_FRAME: u32 = 7;
    const LOST_CHUNK: u8 = 3;

    let mut harness = spawn_udp_pipeline(150, 200).await;
    let producer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    producer.connect(harness.server_addr).await.unwrap();

    for frame_id in 0..FRAMES {
        for (fid, idx, packet) in split_frame(frame_id, &tagged_payload(frame_id, CHUNKS)) {
            if fid == LOST_FRAME && idx == LOST_CHUNK {
                continue;
            }
            producer.send(&packet).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut delivered = Vec::new();
    while delivered.len() < (FRAMES - 1) as usize {
        let (frame_id, _) =
            tokio::time::timeout(Duration::from_secs(5), harness.ordered_rx.recv())
                .await
                .expect("remaining frames within deadline")
                .unwrap();
        delivered.push(frame_id);
    }

    assert!(!delivered.contains(&LOST_FRAME));
    let mut sorted = delivered.clone();
    sorted.sort_unstable();
    assert_eq!(delivered, sorted, "strictly increasing despite the hole");
    assert_eq!(harness.dispatch_stats.timeout_skips.load(Ordering::Relaxed), 1);

    // The incomplete entry eventually expires (the sweep runs on the next
    // datagram after the timeout).
    tokio::time::sleep(Duration::from_millis(200)).await;
    producer
        .send(&split_frame(100, b"probe")[0].2)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.receiver_stats.frames_expired.load(Ordering::Relaxed), 1);
    harness.control.abort();
}

#[tokio::test]
async fn duplicated_chunks_deliver_each_frame_once() {
    const FRAMES: u32 = 10;
    const CHUNKS: usize = 2;

    let mut harness = spawn_udp_pipeline(500, 200).await;
    let producer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    producer.connect(harness.server_addr).await.unwrap();

    // Every chunk sent twice, as if every ACK was lost.
    for frame_id in 0..FRAMES {
        for (_, _, packet) in split_frame(frame_id, &tagged_payload(frame_id, CHUNKS)) {
            producer.send(&packet).await.unwrap();
            producer.send(&packet).await.unwrap();
        }
    }

    for expected in 0..FRAMES {
        let (frame_id, _) =
            tokio::time::timeout(Duration::from_secs(5), harness.ordered_rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(frame_id, expected);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.ordered_rx.try_recv().is_err(), "no duplicates downstream");
    assert_eq!(
        harness.receiver_stats.duplicates.load(Ordering::Relaxed),
        FRAMES as u64 * CHUNKS as u64
    );
    harness.control.abort();
}

#[tokio::test]
async fn producer_cli_streams_jpeg_through_udp_session() {
    const PORT: u16 = 18085;

    let mut config = Config::default();
    config.variant = VariantConfig {
        incoming: Format::Jpg,
        outgoing: Format::Jpg,
        transport: Transport::Udp,
        inference: false,
    };
    config.server.udp_port_jpg = PORT;
    config.codec.width = 64;
    config.codec.height = 48;
    // Generous freshness so slow CI does not flake the assertion.
    config.tuning.freshness_ms = 5_000;

    let session = Session::new(config.clone()).unwrap();
    session.start().await.unwrap();
    let mut subscriber = session.hub().subscribe();

    let producer_task = tokio::spawn(producer::run(
        config,
        ProduceOptions {
            frames: Some(15),
            announce: false,
            ..ProduceOptions::default()
        },
    ));

    // Every delivered frame is a decodable JPEG.
    let payload = tokio::time::timeout(Duration::from_secs(10), subscriber.recv_fresh())
        .await
        .expect("frame within deadline")
        .expect("hub open");
    assert!(payload.starts_with(&[0xFF, 0xD8]));
    framelink::codec::decode_jpeg(&payload).expect("valid JPEG reaches subscribers");

    producer_task.await.unwrap().unwrap();
    session.shutdown().await;
}

#[tokio::test]
async fn reset_starts_next_stream_without_residue() {
    const PORT: u16 = 18087;

    let mut config = Config::default();
    config.variant = VariantConfig {
        incoming: Format::Jpg,
        outgoing: Format::Jpg,
        transport: Transport::Tcp,
        inference: false,
    };
    config.server.tcp_port_jpg = PORT;

    let session = Session::new(config).unwrap();
    session.start().await.unwrap();
    let mut subscriber = session.hub().subscribe();

    // First stream: ids from 100.
    {
        let mut stream = TcpStream::connect(("127.0.0.1", PORT)).await.unwrap();
        for frame_id in 100..103u32 {
            let payload = tagged_payload(frame_id, 1);
            stream
                .write_all(&wire::encode_frame(0, frame_id, &payload))
                .await
                .unwrap();
        }
        for expected in 100..103u32 {
            let frame = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(tag_of(&frame.payload), expected);
        }
    }

    session.reset().await.unwrap();

    // Second stream starts from its own first id; nothing from the first
    // stream appears.
    let mut stream = TcpStream::connect(("127.0.0.1", PORT)).await.unwrap();
    for frame_id in 5..8u32 {
        let payload = tagged_payload(frame_id, 1);
        stream
            .write_all(&wire::encode_frame(0, frame_id, &payload))
            .await
            .unwrap();
    }
    for expected in 5..8u32 {
        let frame = tokio::time::timeout(Duration::from_secs(5), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tag_of(&frame.payload), expected);
    }

    session.shutdown().await;
}

#[test]
fn worker_contract_annotates_and_preserves_frame_ids() {
    // The worker normally runs in its own process; the ring contract is
    // identical when it opens the segments from a thread.
    let prefix = format!("/framelink-it-{}", std::process::id());
    let input_name = format!("{prefix}-in");
    let output_name = format!("{prefix}-out");

    let shape = FrameShape::bgr(64, 48);
    let input = ShmRing::create(&input_name, shape, 8).unwrap();
    let output = ShmRing::create(&output_name, shape, 8).unwrap();

    let worker = {
        let input_name = input_name.clone();
        let output_name = output_name.clone();
        std::thread::spawn(move || framelink::inference::run_worker(&input_name, &output_name))
    };

    for frame_id in [3u32, 9, 27] {
        let frame = RawFrame::new(64, 48, vec![50u8; shape.slot_size()]);
        input.put(&frame.data, frame_id).unwrap();

        let (annotated, got_id) = output.get().unwrap();
        assert_eq!(got_id, frame_id);
        // The stamp landed.
        let i = (8 * 64 + 8) * 3;
        assert_eq!(&annotated[i..i + 3], &[0, 255, 0]);
    }

    input.stop();
    output.stop();
    worker.join().unwrap().unwrap();
}
