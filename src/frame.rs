//! Decoded frames as they flow from a source to the detector.
//!
//! Frames are packed RGB24, row-major, no padding. A frame lives for one
//! processing cycle and is consumed by the detector adapter.

use anyhow::{anyhow, Result};

pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Position of this frame in the source since the last open/rewind.
    pub index: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            index,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// RGB value at a pixel, or `None` outside the frame.
    pub fn rgb_at(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("index", &self.index)
            .finish()
    }
}

/// Outcome of one read from a frame source.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// The source has no more frames (file end, or a live stream dropped).
    EndOfStream,
    /// Transient failure; the same read may succeed if retried.
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_validates_rgb_length() {
        assert!(Frame::new(vec![0u8; 12], 2, 2, 0).is_ok());
        assert!(Frame::new(vec![0u8; 11], 2, 2, 0).is_err());
    }

    #[test]
    fn rgb_at_is_bounds_checked() {
        let mut data = vec![0u8; 12];
        data[9..12].copy_from_slice(&[1, 2, 3]);
        let frame = Frame::new(data, 2, 2, 7).unwrap();
        assert_eq!(frame.rgb_at(1, 1), Some([1, 2, 3]));
        assert_eq!(frame.rgb_at(2, 0), None);
        assert_eq!(frame.index, 7);
    }
}
