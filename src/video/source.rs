//! Frame sources
//!
//! A [`FrameSource`] is a live, continuous sequence of frames at a fixed
//! resolution. `next_frame` is the pipeline's "next frame available"
//! suspension point; the source decides the native cadence.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::debug;

use super::format::Resolution;
use super::frame::VideoFrame;
use crate::error::Result;

/// A live video source delivering frames at its own native rate
#[async_trait]
pub trait FrameSource: Send {
    /// Fixed resolution of every frame this source produces
    fn resolution(&self) -> Resolution;

    /// Wait for and return the next frame
    ///
    /// Errors map to [`crate::error::AppError::Acquisition`] and end the
    /// pipeline's draw loop.
    async fn next_frame(&mut self) -> Result<VideoFrame>;
}

/// Synthetic moving-gradient source
///
/// Stands in for a camera in the demo binary and in tests that need a
/// real cadence. Each frame shifts the gradient by one pixel so
/// consecutive frames differ.
pub struct SyntheticSource {
    resolution: Resolution,
    ticker: Interval,
    sequence: u64,
}

impl SyntheticSource {
    /// Create a source producing `fps` frames per second
    pub fn new(resolution: Resolution, fps: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!("Synthetic source: {} at {} fps", resolution, fps);

        Self {
            resolution,
            ticker,
            sequence: 0,
        }
    }

    fn render(&self) -> Vec<u8> {
        let Resolution { width, height } = self.resolution;
        let mut data = vec![0u8; self.resolution.rgba_len()];
        let shift = self.sequence as u32;

        for y in 0..height {
            for x in 0..width {
                let i = ((y * width + x) * 4) as usize;
                data[i] = ((x + shift) % 256) as u8;
                data[i + 1] = (y % 256) as u8;
                data[i + 2] = 64;
                data[i + 3] = 255;
            }
        }
        data
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    async fn next_frame(&mut self) -> Result<VideoFrame> {
        self.ticker.tick().await;
        let frame = VideoFrame::from_vec(self.render(), self.resolution, self.sequence);
        self.sequence += 1;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_cadence() {
        let mut source = SyntheticSource::new(Resolution::new(4, 4), 30);

        let first = source.next_frame().await.unwrap();
        let second = source.next_frame().await.unwrap();

        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(first.len(), 4 * 4 * 4);
        // gradient shifted between frames
        assert_ne!(first.rgba_at(0, 0), second.rgba_at(0, 0));
    }
}
