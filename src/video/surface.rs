//! Annotation surface
//!
//! The output canvas the pipeline draws onto each cycle: first the raw
//! frame at full opacity, then the detection overlay. The stream capture
//! task snapshots it at a fixed rate, independent of the draw cadence.
//! Single writer (draw loop), single reader (capture task).

use bytes::Bytes;

use super::format::Resolution;
use super::frame::VideoFrame;
use crate::detect::{BoundingBox, Detection, Keypoint};

/// Bounding box stroke width in pixels
const BOX_STROKE: i64 = 2;
/// Bounding box stroke color (blue)
const BOX_COLOR: [u8; 4] = [0, 0, 255, 255];
/// Keypoint disc radius in pixels
const KEYPOINT_RADIUS: i64 = 3;
/// Keypoint fill color (red)
const KEYPOINT_COLOR: [u8; 4] = [255, 0, 0, 255];

/// RGBA drawing surface with annotation primitives
pub struct Surface {
    resolution: Resolution,
    pixels: Vec<u8>,
    snapshots: u64,
}

impl Surface {
    /// Create a black opaque surface
    pub fn new(resolution: Resolution) -> Self {
        let mut pixels = vec![0u8; resolution.rgba_len()];
        for px in pixels.chunks_exact_mut(4) {
            px[3] = 255;
        }
        Self {
            resolution,
            pixels,
            snapshots: 0,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Draw a raw frame onto the surface at full opacity
    ///
    /// Frames at a different resolution are copied row by row into the
    /// top-left corner; the rest of the surface keeps its last content.
    /// A frame whose payload is shorter than its declared resolution
    /// contributes only the complete rows it actually carries.
    pub fn blit(&mut self, frame: &VideoFrame) {
        if frame.resolution == self.resolution && frame.len() == self.pixels.len() {
            self.pixels.copy_from_slice(frame.data());
            return;
        }

        let src_row = frame.resolution.width as usize * 4;
        let dst_row = self.resolution.width as usize * 4;
        if src_row == 0 {
            return;
        }
        let copy = src_row.min(dst_row);
        let rows = (frame.resolution.height as usize)
            .min(self.resolution.height as usize)
            .min(frame.len() / src_row);

        for y in 0..rows {
            let src = &frame.data()[y * src_row..y * src_row + copy];
            self.pixels[y * dst_row..y * dst_row + copy].copy_from_slice(src);
        }
    }

    /// Overlay a set of detections (boxes + keypoints)
    pub fn overlay(&mut self, detections: &[Detection]) {
        for det in detections {
            self.stroke_box(&det.bbox);
            for kp in &det.keypoints {
                self.fill_keypoint(kp);
            }
        }
    }

    /// Stroke a bounding box outline
    pub fn stroke_box(&mut self, bbox: &BoundingBox) {
        let x0 = bbox.x.round() as i64;
        let y0 = bbox.y.round() as i64;
        let x1 = x0 + bbox.width.round() as i64;
        let y1 = y0 + bbox.height.round() as i64;

        for t in 0..BOX_STROKE {
            for x in x0..=x1 {
                self.put_pixel(x, y0 + t, BOX_COLOR);
                self.put_pixel(x, y1 - t, BOX_COLOR);
            }
            for y in y0..=y1 {
                self.put_pixel(x0 + t, y, BOX_COLOR);
                self.put_pixel(x1 - t, y, BOX_COLOR);
            }
        }
    }

    /// Fill a keypoint disc
    pub fn fill_keypoint(&mut self, kp: &Keypoint) {
        let cx = kp.x.round() as i64;
        let cy = kp.y.round() as i64;

        for dy in -KEYPOINT_RADIUS..=KEYPOINT_RADIUS {
            for dx in -KEYPOINT_RADIUS..=KEYPOINT_RADIUS {
                if dx * dx + dy * dy <= KEYPOINT_RADIUS * KEYPOINT_RADIUS {
                    self.put_pixel(cx + dx, cy + dy, KEYPOINT_COLOR);
                }
            }
        }
    }

    /// Capture the current surface content as a frame
    pub fn snapshot(&mut self) -> VideoFrame {
        let frame = VideoFrame::new(
            Bytes::from(self.pixels.clone()),
            self.resolution,
            self.snapshots,
        );
        self.snapshots += 1;
        frame
    }

    /// RGBA value at pixel coordinates, `None` when out of bounds
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.resolution.width || y >= self.resolution.height {
            return None;
        }
        let i = (y as usize * self.resolution.width as usize + x as usize) * 4;
        Some([
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ])
    }

    fn put_pixel(&mut self, x: i64, y: i64, color: [u8; 4]) {
        if x < 0 || y < 0 || x >= self.resolution.width as i64 || y >= self.resolution.height as i64
        {
            return;
        }
        let i = (y as usize * self.resolution.width as usize + x as usize) * 4;
        self.pixels[i..i + 4].copy_from_slice(&color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blit_full_frame() {
        let res = Resolution::new(4, 4);
        let mut surface = Surface::new(res);
        let frame = VideoFrame::from_vec(vec![9u8; res.rgba_len()], res, 0);

        surface.blit(&frame);
        assert_eq!(surface.pixel(3, 3), Some([9, 9, 9, 9]));
    }

    #[test]
    fn test_blit_truncated_payload_copies_complete_rows() {
        let res = Resolution::new(4, 4);
        let mut surface = Surface::new(res);
        // frame claims 4x4 but carries only two rows of pixels
        let frame = VideoFrame::from_vec(vec![9u8; 2 * 4 * 4], res, 0);

        surface.blit(&frame);
        assert_eq!(surface.pixel(3, 1), Some([9, 9, 9, 9]));
        assert_eq!(surface.pixel(0, 2), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_stroke_box_pixels() {
        let mut surface = Surface::new(Resolution::new(20, 20));
        surface.stroke_box(&BoundingBox::new(4.0, 4.0, 10.0, 10.0));

        // on the stroke
        assert_eq!(surface.pixel(4, 4), Some(BOX_COLOR));
        assert_eq!(surface.pixel(14, 14), Some(BOX_COLOR));
        assert_eq!(surface.pixel(9, 5), Some(BOX_COLOR)); // second stroke row
        // interior untouched
        assert_eq!(surface.pixel(9, 9), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_keypoint_disc() {
        let mut surface = Surface::new(Resolution::new(20, 20));
        surface.fill_keypoint(&Keypoint::new(10.0, 10.0));

        assert_eq!(surface.pixel(10, 10), Some(KEYPOINT_COLOR));
        assert_eq!(surface.pixel(13, 10), Some(KEYPOINT_COLOR));
        // outside the radius
        assert_eq!(surface.pixel(14, 10), Some([0, 0, 0, 255]));
    }

    #[test]
    fn test_overlay_out_of_bounds_is_clipped() {
        let mut surface = Surface::new(Resolution::new(8, 8));
        // box partly outside the surface must not panic
        surface.overlay(&[
            Detection::new(BoundingBox::new(-4.0, -4.0, 20.0, 20.0))
                .with_keypoints(vec![Keypoint::new(-2.0, 3.0)]),
        ]);
    }

    #[test]
    fn test_snapshot_sequence() {
        let mut surface = Surface::new(Resolution::new(2, 2));
        assert_eq!(surface.snapshot().sequence, 0);
        assert_eq!(surface.snapshot().sequence, 1);
    }
}
