//! Video frame data structures

use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

use super::format::Resolution;

/// An immutable RGBA video frame with metadata
///
/// Frames are cheap to clone: the pixel data is shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw RGBA pixel data (4 bytes per pixel, row major)
    data: Arc<Bytes>,
    /// Frame resolution
    pub resolution: Resolution,
    /// Frame sequence number
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub capture_ts: Instant,
}

impl VideoFrame {
    /// Create a new video frame
    pub fn new(data: Bytes, resolution: Resolution, sequence: u64) -> Self {
        Self {
            data: Arc::new(data),
            resolution,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    /// Create a frame from a Vec<u8>
    pub fn from_vec(data: Vec<u8>, resolution: Resolution, sequence: u64) -> Self {
        Self::new(Bytes::from(data), resolution, sequence)
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        (*self.data).clone()
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if frame is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get width
    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    /// Get height
    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// RGBA value at pixel coordinates, `None` when out of bounds
    pub fn rgba_at(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.resolution.width || y >= self.resolution.height {
            return None;
        }
        let offset = (y as usize * self.resolution.width as usize + x as usize) * 4;
        self.data
            .get(offset..offset + 4)
            .map(|px| [px[0], px[1], px[2], px[3]])
    }

    /// Get age of this frame (time since capture)
    pub fn age(&self) -> std::time::Duration {
        self.capture_ts.elapsed()
    }
}
