//! H.264 decode and encode over openh264
//!
//! The configured hardware device is tried first; any initialization
//! failure falls back to the software codec. Encoding targets the live
//! streaming profile: zero-latency, no B-frames, fixed GOP.

use bytes::Bytes;
use openh264::decoder::Decoder;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate};
use openh264::formats::{YUVSlices, YUVSource};
use openh264::OpenH264API;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{is_keyframe, CodecError, RawFrame, RawFrameSink};
use crate::config::CodecConfig;
use crate::wire::H264Packet;

/// H.264 to BGR decoder.
pub struct H264Decoder {
    inner: Decoder,
}

impl H264Decoder {
    pub fn new(hw_device: Option<&str>) -> Result<Self, CodecError> {
        if let Some(device) = hw_device {
            // Hardware decode paths are device-specific; this build only
            // ships the software decoder, which is the fallback anyway.
            warn!(device, "hardware decoder unavailable, using software decoder");
        }
        let inner = Decoder::new()?;
        info!("software H.264 decoder ready");
        Ok(Self { inner })
    }

    /// Decodes one access unit. Returns `None` while the decoder is
    /// buffering (no frame emitted yet).
    pub fn decode(&mut self, packet: &H264Packet) -> Result<Option<RawFrame>, CodecError> {
        let Some(yuv) = self.inner.decode(&packet.data)? else {
            return Ok(None);
        };
        let (width, height) = yuv.dimensions();
        let mut data = vec![0u8; width * height * 3];
        yuv.write_rgb8(&mut data);
        // openh264 hands back RGB; the pipeline is BGR end to end.
        for pixel in data.chunks_exact_mut(3) {
            pixel.swap(0, 2);
        }
        Ok(Some(RawFrame::new(width as u32, height as u32, data)))
    }
}

/// BGR to H.264 encoder.
pub struct H264Encoder {
    inner: Encoder,
    fps: u32,
    frame_index: u64,
}

impl H264Encoder {
    pub fn new(config: &CodecConfig) -> Result<Self, CodecError> {
        if let Some(device) = &config.hw_device {
            warn!(device = %device, "hardware encoder unavailable, using software encoder");
        }
        let api = OpenH264API::from_source();
        let encoder_config = EncoderConfig::new()
            .max_frame_rate(FrameRate::from_hz(config.fps as f32))
            .bitrate(BitRate::from_bps(config.bitrate));
        let inner = Encoder::with_api_config(api, encoder_config)?;
        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            bitrate = config.bitrate,
            "software H.264 encoder ready"
        );
        Ok(Self {
            inner,
            fps: config.fps,
            frame_index: 0,
        })
    }

    /// Encodes one raw frame. Returns `None` when the encoder emits no
    /// packet for this frame.
    pub fn encode(&mut self, frame: &RawFrame) -> Result<Option<H264Packet>, CodecError> {
        let (y, u, v) = bgr_to_yuv420(frame);
        let width = frame.width as usize;
        let height = frame.height as usize;
        let slices = YUVSlices::new(
            (&y, &u, &v),
            (width, height),
            (width, width / 2, width / 2),
        );

        let bitstream = self.inner.encode(&slices)?;
        let data = bitstream.to_vec();

        let pts_us = self.frame_index * 1_000_000 / self.fps as u64;
        self.frame_index += 1;

        if data.is_empty() {
            return Ok(None);
        }
        let keyframe = is_keyframe(&data);
        Ok(Some(H264Packet {
            pts_us,
            is_keyframe: keyframe,
            data: Bytes::from(data),
        }))
    }
}

/// BGR24 to planar YUV 4:2:0 (BT.601). Chroma is averaged over each 2x2
/// block. Width and height must be even.
fn bgr_to_yuv420(frame: &RawFrame) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let data = &frame.data;

    let mut y_plane = vec![0u8; width * height];
    let mut u_plane = vec![0u8; width * height / 4];
    let mut v_plane = vec![0u8; width * height / 4];

    for row in 0..height {
        for col in 0..width {
            let i = (row * width + col) * 3;
            let (b, g, r) = (data[i] as i32, data[i + 1] as i32, data[i + 2] as i32);
            y_plane[row * width + col] =
                (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;
        }
    }

    for row in (0..height).step_by(2) {
        for col in (0..width).step_by(2) {
            let mut u_sum = 0i32;
            let mut v_sum = 0i32;
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let i = ((row + dy) * width + col + dx) * 3;
                let (b, g, r) = (data[i] as i32, data[i + 1] as i32, data[i + 2] as i32);
                u_sum += ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                v_sum += ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
            }
            let chroma_idx = (row / 2) * (width / 2) + col / 2;
            u_plane[chroma_idx] = (u_sum / 4).clamp(0, 255) as u8;
            v_plane[chroma_idx] = (v_sum / 4).clamp(0, 255) as u8;
        }
    }

    (y_plane, u_plane, v_plane)
}

/// Blocking decode loop: packed access units in, raw frames out. The
/// decoder lives entirely on the worker thread.
pub fn spawn_decode_task(
    hw_device: Option<String>,
    mut rx: mpsc::Receiver<(u32, Bytes)>,
    sink: RawFrameSink,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut decoder = match H264Decoder::new(hw_device.as_deref()) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!(error = %e, "failed to initialize H.264 decoder");
                return;
            }
        };

        while let Some((frame_id, packed)) = rx.blocking_recv() {
            let packet = match H264Packet::unpack(&packed) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(frame_id, error = %e, "bad H.264 packet framing");
                    continue;
                }
            };
            match decoder.decode(&packet) {
                Ok(Some(frame)) => {
                    if !sink.deliver(frame_id, frame) {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(frame_id, error = %e, "decode failed, frame skipped");
                }
            }
        }
        debug!("H.264 decode task stopped");
    })
}

/// Blocking encode loop: raw frames in, packed access units out.
pub fn spawn_encode_task(
    config: CodecConfig,
    mut rx: mpsc::Receiver<(u32, RawFrame)>,
    out: mpsc::Sender<(u32, Bytes)>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut encoder = match H264Encoder::new(&config) {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!(error = %e, "failed to initialize H.264 encoder");
                return;
            }
        };

        while let Some((frame_id, frame)) = rx.blocking_recv() {
            match encoder.encode(&frame) {
                Ok(Some(packet)) => {
                    if out.blocking_send((frame_id, packet.pack())).is_err() {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(frame_id, error = %e, "encode failed, frame skipped");
                }
            }
        }
        debug!("H.264 encode task stopped");
    })
}
