//! Frame pipeline
//!
//! Drives the per-frame cycle: wait for the next input frame, draw it
//! onto the annotation surface, run detection, overlay the result. A
//! separate free-running capture task snapshots the surface at a fixed
//! rate into a broadcast channel; that channel is the outgoing stream
//! the peer connection consumes.
//!
//! Detection never stalls the draw loop: at most one detect call is in
//! flight, and while it is pending the previous overlay is reused. A
//! failed detect clears the overlay for that cycle and the loop keeps
//! going.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::format::Resolution;
use super::frame::VideoFrame;
use super::source::FrameSource;
use super::surface::Surface;
use crate::detect::{Detection, FaceDetector};
use crate::error::Result;
use crate::events::{EventBus, SessionEvent};

/// Frame pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Where the detector loads its model from
    pub model_location: String,
    /// Fixed rate of the captured output stream
    pub capture_fps: u32,
    /// Capacity of the outgoing frame broadcast channel
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_location: "models/face".to_string(),
            capture_fps: 30,
            channel_capacity: 16,
        }
    }
}

/// Pipeline counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_drawn: AtomicU64,
    detect_runs: AtomicU64,
    detect_failures: AtomicU64,
    captures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStatsSnapshot {
    pub frames_drawn: u64,
    pub detect_runs: u64,
    pub detect_failures: u64,
    pub captures: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            frames_drawn: self.frames_drawn.load(Ordering::Relaxed),
            detect_runs: self.detect_runs.load(Ordering::Relaxed),
            detect_failures: self.detect_failures.load(Ordering::Relaxed),
            captures: self.captures.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running frame pipeline
///
/// Dropping the handle does not stop the pipeline; cancellation of the
/// token passed to [`FramePipeline::start`] does.
pub struct PipelineHandle {
    frame_tx: broadcast::Sender<VideoFrame>,
    resolution: Resolution,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    /// Subscribe to the outgoing annotated stream
    pub fn subscribe(&self) -> broadcast::Receiver<VideoFrame> {
        self.frame_tx.subscribe()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }
}

/// The frame transformation pipeline
pub struct FramePipeline;

impl FramePipeline {
    /// Initialize the detector and start the draw + capture tasks
    ///
    /// Detector initialization failure aborts startup before anything is
    /// spawned; no stream is produced.
    pub async fn start(
        source: Box<dyn FrameSource>,
        detector: Arc<dyn FaceDetector>,
        config: PipelineConfig,
        cancel: CancellationToken,
        bus: Arc<EventBus>,
    ) -> Result<PipelineHandle> {
        detector.initialize(&config.model_location).await?;

        let resolution = source.resolution();
        let surface = Arc::new(RwLock::new(Surface::new(resolution)));
        let (frame_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        let stats = Arc::new(PipelineStats::default());

        info!(
            "Frame pipeline starting: {} -> {} fps capture",
            resolution, config.capture_fps
        );

        tokio::spawn(draw_loop(
            source,
            detector,
            surface.clone(),
            stats.clone(),
            bus,
            cancel.clone(),
        ));
        tokio::spawn(capture_loop(
            surface,
            frame_tx.clone(),
            config.capture_fps,
            stats.clone(),
            cancel,
        ));

        Ok(PipelineHandle {
            frame_tx,
            resolution,
            stats,
        })
    }
}

/// Per-frame draw cycle, synchronized to the source's native delivery
async fn draw_loop(
    mut source: Box<dyn FrameSource>,
    detector: Arc<dyn FaceDetector>,
    surface: Arc<RwLock<Surface>>,
    stats: Arc<PipelineStats>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) {
    let mut overlay: Vec<Detection> = Vec::new();
    let mut in_flight: Option<oneshot::Receiver<Result<Vec<Detection>>>> = None;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.next_frame() => match next {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Frame source ended: {}", e);
                    bus.publish(SessionEvent::PipelineStopped {
                        reason: e.to_string(),
                    });
                    break;
                }
            },
        };

        // Collect a finished detection without waiting for a pending one.
        if let Some(rx) = in_flight.as_mut() {
            match rx.try_recv() {
                Ok(Ok(detections)) => {
                    overlay = detections;
                    in_flight = None;
                }
                Ok(Err(e)) => {
                    stats.detect_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Detection failed, emitting raw frame: {}", e);
                    bus.publish(SessionEvent::DetectorDegraded {
                        reason: e.to_string(),
                    });
                    overlay.clear();
                    in_flight = None;
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    // still pending: reuse the previous overlay this cycle
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    debug!("Detection task dropped its result");
                    in_flight = None;
                }
            }
        }

        {
            let mut surface = surface.write();
            surface.blit(&frame);
            surface.overlay(&overlay);
        }
        stats.frames_drawn.fetch_add(1, Ordering::Relaxed);

        if in_flight.is_none() {
            let (tx, rx) = oneshot::channel();
            let detector = detector.clone();
            let cancel = cancel.clone();
            stats.detect_runs.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = detector.detect(&frame) => {
                        let _ = tx.send(result);
                    }
                }
            });
            in_flight = Some(rx);
        }
    }

    debug!("Draw loop stopped");
}

/// Free-running capture of the surface at a fixed rate
async fn capture_loop(
    surface: Arc<RwLock<Surface>>,
    frame_tx: broadcast::Sender<VideoFrame>,
    fps: u32,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frame = surface.write().snapshot();
        stats.captures.fetch_add(1, Ordering::Relaxed);
        // No receivers is fine; frames are fire-and-forget.
        let _ = frame_tx.send(frame);
    }

    debug!("Capture loop stopped");
}
