//! Frame transformation pipeline

pub mod format;
pub mod frame;
pub mod pipeline;
pub mod source;
pub mod surface;

pub use format::Resolution;
pub use frame::VideoFrame;
pub use pipeline::{FramePipeline, PipelineConfig, PipelineHandle, PipelineStatsSnapshot};
pub use source::{FrameSource, SyntheticSource};
pub use surface::Surface;
