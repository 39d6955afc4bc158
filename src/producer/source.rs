//! Frame sources for the producer CLI
//!
//! Camera capture is a separate concern; the producer accepts anything
//! that yields raw frames. The built-in source renders a moving gradient
//! so the pipeline can be driven without hardware.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::warn;

use crate::codec::RawFrame;

pub trait FrameSource: Send {
    /// Next raw frame, or `None` when the source is exhausted.
    fn next_frame(&mut self) -> Option<RawFrame>;
}

/// Synthetic moving-gradient source.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    remaining: Option<u64>,
    tick: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, frames: Option<u64>) -> Self {
        Self {
            width,
            height,
            remaining: frames,
            tick: 0,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> Option<RawFrame> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }

        let phase = (self.tick % 255) as u8;
        self.tick += 1;

        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(phase.wrapping_add((x * 255 / self.width) as u8));
                data.push(phase.wrapping_add((y * 255 / self.height) as u8));
                data.push(phase);
            }
        }
        Some(RawFrame::new(self.width, self.height, data))
    }
}

/// Reads consecutive raw BGR frames of a fixed shape from a dump file.
/// Ends at EOF; a trailing partial frame is discarded with a warning.
pub struct FileSource {
    file: File,
    width: u32,
    height: u32,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P, width: u32, height: u32) -> std::io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            width,
            height,
        })
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self) -> Option<RawFrame> {
        let mut data = vec![0u8; (self.width * self.height * 3) as usize];
        let mut filled = 0;
        while filled < data.len() {
            match self.file.read(&mut data[filled..]) {
                Ok(0) => {
                    if filled > 0 {
                        warn!(bytes = filled, "trailing partial frame discarded");
                    }
                    return None;
                }
                Ok(n) => filled += n,
                Err(e) => {
                    warn!(error = %e, "frame dump read failed");
                    return None;
                }
            }
        }
        Some(RawFrame::new(self.width, self.height, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pattern_respects_frame_limit() {
        let mut source = TestPatternSource::new(8, 8, Some(3));
        assert!(source.next_frame().is_some());
        assert!(source.next_frame().is_some());
        assert!(source.next_frame().is_some());
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn test_pattern_moves_between_frames() {
        let mut source = TestPatternSource::new(8, 8, None);
        let first = source.next_frame().unwrap();
        let second = source.next_frame().unwrap();
        assert_ne!(first.data, second.data);
        assert_eq!(first.byte_len(), second.byte_len());
    }

    #[test]
    fn test_file_source_reads_whole_frames_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.bgr");

        // Two full 4x2 frames plus a truncated third.
        let frame_len = 4 * 2 * 3;
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![1u8; frame_len]).unwrap();
        file.write_all(&vec![2u8; frame_len]).unwrap();
        file.write_all(&[3u8; 5]).unwrap();
        drop(file);

        let mut source = FileSource::open(&path, 4, 2).unwrap();
        assert_eq!(source.next_frame().unwrap().data[0], 1);
        assert_eq!(source.next_frame().unwrap().data[0], 2);
        assert!(source.next_frame().is_none());
    }
}
