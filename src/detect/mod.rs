//! Face detection adapter
//!
//! Wraps an external detector capability behind a uniform async interface.
//! The pipeline only depends on the [`FaceDetector`] trait; concrete
//! implementations (model loading, inference) live outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::video::frame::VideoFrame;

/// Axis-aligned bounding box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Origin X
    pub x: f32,
    /// Origin Y
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A single facial keypoint in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// One detected face: bounding box plus ordered keypoints
///
/// Detections carry no identity across frames; no tracking or
/// correlation is performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keypoints: Vec<Keypoint>,
}

impl Detection {
    pub fn new(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            keypoints: Vec::new(),
        }
    }

    pub fn with_keypoints(mut self, keypoints: Vec<Keypoint>) -> Self {
        self.keypoints = keypoints;
        self
    }
}

/// Async face detection interface
///
/// `initialize` failure is fatal: the pipeline must not start.
/// `detect` failure is per-frame: the pipeline degrades to emitting the
/// raw frame for that cycle and keeps running. Both are suspension
/// points; implementations must never block the calling task.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Load the model / resources from the given location
    async fn initialize(&self, model_location: &str) -> Result<()>;

    /// Detect faces in one frame
    ///
    /// Called once per pipeline cycle at the target cadence. The frame
    /// is never mutated.
    async fn detect(&self, frame: &VideoFrame) -> Result<Vec<Detection>>;
}

/// Detector that never finds anything
///
/// Degenerate adapter used by the demo binary and as a placeholder
/// while no real inference backend is wired in.
#[derive(Debug, Default)]
pub struct NullDetector;

#[async_trait]
impl FaceDetector for NullDetector {
    async fn initialize(&self, _model_location: &str) -> Result<()> {
        Ok(())
    }

    async fn detect(&self, _frame: &VideoFrame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}
