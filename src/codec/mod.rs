//! Codec stage: H.264 and JPEG transcode helpers
//!
//! Raw frames are BGR24, row-major, fixed shape. All codec work is
//! blocking and runs on the worker pool (`spawn_blocking`); the async
//! pipeline talks to it over channels. H.264 access units travel with the
//! server-internal `pts_us | is_keyframe | NAL` framing from [`crate::wire`].

pub mod h264;

pub use h264::{spawn_decode_task, spawn_encode_task, H264Decoder, H264Encoder};

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::shm::{ShmError, ShmRing};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("H.264 codec error: {0}")]
    H264(#[from] openh264::Error),

    #[error("JPEG codec error: {0}")]
    Jpeg(#[from] image::ImageError),

    #[error("frame has no pixel data")]
    EmptyFrame,
}

/// One decoded image, BGR24.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Where a decode stage delivers raw frames: the inference input ring, or
/// a plain channel when inference is disabled.
pub enum RawFrameSink {
    Ring(Arc<ShmRing>),
    Channel(mpsc::Sender<(u32, RawFrame)>),
}

impl RawFrameSink {
    /// Delivers one frame. Returns `false` when the sink is gone and the
    /// producing task should exit.
    pub fn deliver(&self, frame_id: u32, frame: RawFrame) -> bool {
        match self {
            RawFrameSink::Ring(ring) => match ring.put(&frame.data, frame_id) {
                Ok(()) => true,
                Err(ShmError::Stopped) => false,
                Err(e) => {
                    warn!(frame_id, error = %e, "raw frame rejected by ring");
                    true
                }
            },
            RawFrameSink::Channel(tx) => tx.blocking_send((frame_id, frame)).is_ok(),
        }
    }
}

/// Scans Annex-B NAL units for an IDR slice (type 5). Used when the
/// keyframe flag is not carried alongside the bitstream.
pub fn is_keyframe(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        let nal_start = if data[i..].starts_with(&[0, 0, 0, 1]) {
            i + 4
        } else if data[i..].starts_with(&[0, 0, 1]) {
            i + 3
        } else {
            i += 1;
            continue;
        };
        if nal_start >= data.len() {
            break;
        }
        if data[nal_start] & 0x1F == 5 {
            return true;
        }
        i = nal_start + 1;
    }
    false
}

/// Decodes a JPEG into a BGR raw frame.
pub fn decode_jpeg(bytes: &[u8]) -> Result<RawFrame, CodecError> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)?;
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut data = rgb.into_raw();
    swap_rb_in_place(&mut data);
    Ok(RawFrame::new(width, height, data))
}

/// Encodes a BGR raw frame as JPEG at the given quality.
pub fn encode_jpeg(frame: &RawFrame, quality: u8) -> Result<Bytes, CodecError> {
    if frame.data.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    let mut rgb = frame.data.clone();
    swap_rb_in_place(&mut rgb);

    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode(&rgb, frame.width, frame.height, image::ColorType::Rgb8)?;
    Ok(Bytes::from(out))
}

/// BGR <-> RGB channel swap, both directions are the same operation.
fn swap_rb_in_place(data: &mut [u8]) {
    for pixel in data.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
}

/// Blocking loop decoding JPEG payloads into a raw-frame sink. Feeds the
/// inference ring on JPG-input variants.
pub fn spawn_jpeg_decode_task(
    mut rx: mpsc::Receiver<(u32, Bytes)>,
    sink: RawFrameSink,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some((frame_id, bytes)) = rx.blocking_recv() {
            let frame = match decode_jpeg(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(frame_id, error = %e, "failed to decode reassembled JPEG");
                    continue;
                }
            };
            if !sink.deliver(frame_id, frame) {
                break;
            }
        }
        debug!("JPEG decode task stopped");
    })
}

/// Blocking loop encoding raw frames to JPEG. Output pairs go to the
/// fan-out route.
pub fn spawn_jpeg_encode_task(
    quality: u8,
    mut rx: mpsc::Receiver<(u32, RawFrame)>,
    out: mpsc::Sender<(u32, Bytes)>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some((frame_id, frame)) = rx.blocking_recv() {
            let bytes = match encode_jpeg(&frame, quality) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(frame_id, error = %e, "failed to encode JPEG");
                    continue;
                }
            };
            if out.blocking_send((frame_id, bytes)).is_err() {
                break;
            }
        }
        debug!("JPEG encode task stopped");
    })
}
