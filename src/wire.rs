//! On-wire formats shared by the producer and the server
//!
//! Every packet is wrapped by a 4-byte start marker and a 4-byte end
//! marker. All multi-byte integers are big-endian. The UDP chunk header is
//! 19 bytes; the TCP frame header is also 19 bytes but carries no chunking
//! fields (one packet is one frame).
//!
//! ```text
//! UDP: START(4) | timestamp_ms(4) | frame_id(3) | total_chunks(1) |
//!      chunk_index(1) | chunk_length(2) | crc32(4) | payload(N) | END(4)
//! TCP: START(4) | timestamp_ms(4) | frame_id(3) | chunk_length(4) |
//!      crc32(4) | payload(N) | END(4)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Start-of-packet marker.
pub const START_MARKER: [u8; 4] = [0x01, 0x02, 0x7F, 0xED];
/// End-of-packet marker.
pub const END_MARKER: [u8; 4] = [0x03, 0x04, 0x7F, 0xED];
/// Acknowledgement marker.
pub const ACK_MARKER: [u8; 4] = [0x05, 0x06, 0x7F, 0xED];

/// UDP chunk header size (both markers excluded).
pub const UDP_HEADER_SIZE: usize = 19;
/// TCP frame header size (start marker included, end marker excluded).
pub const TCP_HEADER_SIZE: usize = 19;
/// UDP ACK: marker + frame_id(3) + chunk_index(1).
pub const UDP_ACK_SIZE: usize = 8;
/// TCP ACK: marker + frame_id(3).
pub const TCP_ACK_SIZE: usize = 7;

/// Largest datagram the producer will emit.
pub const MAX_UDP_PACKET_SIZE: usize = 1450;
/// Payload bytes per UDP chunk after header and end marker.
pub const MAX_PAYLOAD_SIZE: usize = MAX_UDP_PACKET_SIZE - UDP_HEADER_SIZE - END_MARKER.len();

/// Frame identifiers are 24-bit and wrap modulo this.
pub const FRAME_ID_MODULUS: u32 = 1 << 24;
const FRAME_ID_MASK: u32 = FRAME_ID_MODULUS - 1;
const FRAME_ID_HALF: u32 = FRAME_ID_MODULUS / 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("packet too small: {0} bytes")]
    TooShort(usize),

    #[error("invalid start marker")]
    BadStartMarker,

    #[error("invalid end marker")]
    BadEndMarker,

    #[error("payload length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// IEEE CRC-32 of a payload.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Wall clock in milliseconds, truncated to the wire's 32-bit field.
pub fn wall_clock_ms() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    (ms & 0xFFFF_FFFF) as u32
}

/// Client-to-server transit time, modulo 2^32.
pub fn elapsed_ms(client_ts: u32, server_ts: u32) -> u32 {
    server_ts.wrapping_sub(client_ts)
}

/// Wrap-aware "a comes before b" over the 24-bit frame-id space.
///
/// Uses the half-range rule: `a` precedes `b` when the forward distance
/// from `a` to `b` is shorter than half the modulus.
pub fn seq_less(a: u32, b: u32) -> bool {
    a != b && (b.wrapping_sub(a) & FRAME_ID_MASK) < FRAME_ID_HALF
}

/// Successor of a 24-bit frame id.
pub fn seq_next(id: u32) -> u32 {
    (id + 1) & FRAME_ID_MASK
}

/// Header of one UDP chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Producer wall clock, lower 32 bits, milliseconds.
    pub timestamp_ms: u32,
    /// 24-bit frame identifier.
    pub frame_id: u32,
    pub total_chunks: u8,
    pub chunk_index: u8,
    pub chunk_length: u16,
    pub crc32: u32,
}

impl ChunkHeader {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(&START_MARKER);
        buf.put_u32(self.timestamp_ms);
        buf.put_slice(&(self.frame_id & FRAME_ID_MASK).to_be_bytes()[1..]);
        buf.put_u8(self.total_chunks);
        buf.put_u8(self.chunk_index);
        buf.put_u16(self.chunk_length);
        buf.put_u32(self.crc32);
    }

    fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < UDP_HEADER_SIZE {
            return Err(WireError::TooShort(data.len()));
        }
        if data[0..4] != START_MARKER {
            return Err(WireError::BadStartMarker);
        }
        Ok(Self {
            timestamp_ms: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            frame_id: u32::from_be_bytes([0, data[8], data[9], data[10]]),
            total_chunks: data[11],
            chunk_index: data[12],
            chunk_length: u16::from_be_bytes([data[13], data[14]]),
            crc32: u32::from_be_bytes([data[15], data[16], data[17], data[18]]),
        })
    }
}

/// Builds a complete UDP chunk datagram for `payload`.
pub fn encode_chunk(
    timestamp_ms: u32,
    frame_id: u32,
    total_chunks: u8,
    chunk_index: u8,
    payload: &[u8],
) -> Bytes {
    let header = ChunkHeader {
        timestamp_ms,
        frame_id,
        total_chunks,
        chunk_index,
        chunk_length: payload.len() as u16,
        crc32: crc32(payload),
    };
    let mut buf = BytesMut::with_capacity(UDP_HEADER_SIZE + payload.len() + END_MARKER.len());
    header.put(&mut buf);
    buf.put_slice(payload);
    buf.put_slice(&END_MARKER);
    buf.freeze()
}

/// Splits a datagram into header and payload, validating both markers and
/// the length field. The CRC is *not* checked here; the receiver decides
/// what to do with a mismatch.
pub fn decode_chunk(datagram: &Bytes) -> Result<(ChunkHeader, Bytes), WireError> {
    if datagram.len() < UDP_HEADER_SIZE + END_MARKER.len() {
        return Err(WireError::TooShort(datagram.len()));
    }
    if datagram[datagram.len() - END_MARKER.len()..] != END_MARKER {
        return Err(WireError::BadEndMarker);
    }
    let header = ChunkHeader::parse(datagram)?;
    let payload = datagram.slice(UDP_HEADER_SIZE..datagram.len() - END_MARKER.len());
    if header.chunk_length as usize != payload.len() {
        return Err(WireError::LengthMismatch {
            expected: header.chunk_length as usize,
            actual: payload.len(),
        });
    }
    Ok((header, payload))
}

/// Header of one TCP frame packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub timestamp_ms: u32,
    pub frame_id: u32,
    pub chunk_length: u32,
    pub crc32: u32,
}

impl FrameHeader {
    fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < TCP_HEADER_SIZE {
            return Err(WireError::TooShort(data.len()));
        }
        if data[0..4] != START_MARKER {
            return Err(WireError::BadStartMarker);
        }
        Ok(Self {
            timestamp_ms: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            frame_id: u32::from_be_bytes([0, data[8], data[9], data[10]]),
            chunk_length: u32::from_be_bytes([data[11], data[12], data[13], data[14]]),
            crc32: u32::from_be_bytes([data[15], data[16], data[17], data[18]]),
        })
    }
}

/// Builds a complete TCP frame packet for `payload`.
pub fn encode_frame(timestamp_ms: u32, frame_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TCP_HEADER_SIZE + payload.len() + END_MARKER.len());
    buf.put_slice(&START_MARKER);
    buf.put_u32(timestamp_ms);
    buf.put_slice(&(frame_id & FRAME_ID_MASK).to_be_bytes()[1..]);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc32(payload));
    buf.put_slice(payload);
    buf.put_slice(&END_MARKER);
    buf.freeze()
}

/// Parses one marker-delimited TCP packet (start marker through end
/// marker inclusive), as located by the scan buffer.
pub fn decode_frame(packet: &[u8]) -> Result<(FrameHeader, Bytes), WireError> {
    if packet.len() < TCP_HEADER_SIZE + END_MARKER.len() {
        return Err(WireError::TooShort(packet.len()));
    }
    if packet[packet.len() - END_MARKER.len()..] != END_MARKER {
        return Err(WireError::BadEndMarker);
    }
    let header = FrameHeader::parse(packet)?;
    let payload = &packet[TCP_HEADER_SIZE..packet.len() - END_MARKER.len()];
    if header.chunk_length as usize != payload.len() {
        return Err(WireError::LengthMismatch {
            expected: header.chunk_length as usize,
            actual: payload.len(),
        });
    }
    Ok((header, Bytes::copy_from_slice(payload)))
}

/// Encodes a per-chunk UDP acknowledgement.
pub fn encode_udp_ack(frame_id: u32, chunk_index: u8) -> [u8; UDP_ACK_SIZE] {
    let id = (frame_id & FRAME_ID_MASK).to_be_bytes();
    [
        ACK_MARKER[0],
        ACK_MARKER[1],
        ACK_MARKER[2],
        ACK_MARKER[3],
        id[1],
        id[2],
        id[3],
        chunk_index,
    ]
}

/// Decodes a per-chunk UDP acknowledgement, if `data` is one.
pub fn decode_udp_ack(data: &[u8]) -> Option<(u32, u8)> {
    if data.len() != UDP_ACK_SIZE || data[0..4] != ACK_MARKER {
        return None;
    }
    let frame_id = u32::from_be_bytes([0, data[4], data[5], data[6]]);
    Some((frame_id, data[7]))
}

/// Encodes a full-frame TCP acknowledgement.
pub fn encode_tcp_ack(frame_id: u32) -> [u8; TCP_ACK_SIZE] {
    let id = (frame_id & FRAME_ID_MASK).to_be_bytes();
    [
        ACK_MARKER[0],
        ACK_MARKER[1],
        ACK_MARKER[2],
        ACK_MARKER[3],
        id[1],
        id[2],
        id[3],
    ]
}

/// Decodes a full-frame TCP acknowledgement, if `data` is one.
pub fn decode_tcp_ack(data: &[u8]) -> Option<u32> {
    if data.len() != TCP_ACK_SIZE || data[0..4] != ACK_MARKER {
        return None;
    }
    Some(u32::from_be_bytes([0, data[4], data[5], data[6]]))
}

/// An encoded H.264 access unit with its server-internal framing:
/// `pts_us(8, big-endian) | is_keyframe(1) | NAL bytes`.
#[derive(Debug, Clone)]
pub struct H264Packet {
    pub pts_us: u64,
    pub is_keyframe: bool,
    pub data: Bytes,
}

impl H264Packet {
    /// Serializes the packet with its 9-byte prefix.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u64(self.pts_us);
        buf.put_u8(self.is_keyframe as u8);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Splits the 9-byte prefix off a packed packet.
    pub fn unpack(packed: &Bytes) -> Result<Self, WireError> {
        if packed.len() < 9 {
            return Err(WireError::TooShort(packed.len()));
        }
        let pts_us = u64::from_be_bytes(packed[0..8].try_into().unwrap());
        Ok(Self {
            pts_us,
            is_keyframe: packed[8] == 1,
            data: packed.slice(9..),
        })
    }
}
