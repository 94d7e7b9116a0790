//! Session orchestrator
//!
//! Wires the frame pipeline's outgoing stream into the negotiation
//! state machine and the machine's remote-stream events into a render
//! sink. Startup order matters: the pipeline must be producing before
//! the track is attached, and the track must be attached before the
//! first offer, so the offer's media section reflects it. A failure at
//! any step tears down whatever was built; no half-initialized peer
//! ever negotiates.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::detect::FaceDetector;
use crate::error::Result;
use crate::events::{EventBus, SessionEvent};
use crate::signaling::{SignalingMediator, SignalingMessage};
use crate::video::pipeline::{FramePipeline, PipelineConfig, PipelineHandle, PipelineStatsSnapshot};
use crate::video::source::FrameSource;
use crate::webrtc::config::WebRtcConfig;
use crate::webrtc::peer::{PeerBackend, PeerEvent, RenderSink, RtcPeer};
use crate::webrtc::track::TrackConfig;
use crate::webrtc::{NegotiationState, Negotiator};

/// Capacity of the peer event channel
const PEER_EVENT_CAPACITY: usize = 64;

/// Session configuration
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub pipeline: PipelineConfig,
    pub webrtc: WebRtcConfig,
    pub track: TrackConfig,
}

/// One publishing session: exactly one outgoing stream, at most one
/// rendered remote stream
pub struct Session {
    cancel: CancellationToken,
    bus: Arc<EventBus>,
    pipeline: PipelineHandle,
    backend: Arc<dyn PeerBackend>,
    negotiation: JoinHandle<()>,
    state: watch::Receiver<NegotiationState>,
}

impl Session {
    /// Start a session over the production webrtc-rs backend
    pub async fn start(
        source: Box<dyn FrameSource>,
        detector: Arc<dyn FaceDetector>,
        mediator: Arc<dyn SignalingMediator>,
        signal_rx: mpsc::Receiver<SignalingMessage>,
        render_sink: Arc<dyn RenderSink>,
        config: SessionConfig,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let bus = Arc::new(EventBus::new());

        // Pipeline first: detector initialization failure aborts here,
        // before a peer connection even exists.
        let pipeline = Self::start_pipeline(source, detector, &config, &cancel, &bus).await?;

        let (peer_tx, peer_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let backend = match RtcPeer::new(&config.webrtc, peer_tx).await {
            Ok(backend) => Arc::new(backend) as Arc<dyn PeerBackend>,
            Err(e) => {
                error!("Session startup aborted: {}", e);
                cancel.cancel();
                return Err(e);
            }
        };

        Self::wire(
            pipeline, backend, peer_rx, mediator, signal_rx, render_sink, config, cancel, bus,
        )
        .await
    }

    /// Start a session over a caller-supplied peer backend
    ///
    /// Same startup sequence as `start`, with the backend injected.
    /// Tests drive it with a scripted backend.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_with_backend(
        source: Box<dyn FrameSource>,
        detector: Arc<dyn FaceDetector>,
        mediator: Arc<dyn SignalingMediator>,
        signal_rx: mpsc::Receiver<SignalingMessage>,
        render_sink: Arc<dyn RenderSink>,
        backend: Arc<dyn PeerBackend>,
        peer_rx: mpsc::Receiver<PeerEvent>,
        config: SessionConfig,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let bus = Arc::new(EventBus::new());

        let pipeline = match Self::start_pipeline(source, detector, &config, &cancel, &bus).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                let _ = backend.close().await;
                return Err(e);
            }
        };

        Self::wire(
            pipeline, backend, peer_rx, mediator, signal_rx, render_sink, config, cancel, bus,
        )
        .await
    }

    async fn start_pipeline(
        source: Box<dyn FrameSource>,
        detector: Arc<dyn FaceDetector>,
        config: &SessionConfig,
        cancel: &CancellationToken,
        bus: &Arc<EventBus>,
    ) -> Result<PipelineHandle> {
        match FramePipeline::start(
            source,
            detector,
            config.pipeline.clone(),
            cancel.child_token(),
            bus.clone(),
        )
        .await
        {
            Ok(pipeline) => {
                bus.publish(SessionEvent::PipelineStarted);
                Ok(pipeline)
            }
            Err(e) => {
                error!("Session startup aborted: {}", e);
                cancel.cancel();
                Err(e)
            }
        }
    }

    /// Attach the outgoing stream and spawn the negotiation loop
    #[allow(clippy::too_many_arguments)]
    async fn wire(
        pipeline: PipelineHandle,
        backend: Arc<dyn PeerBackend>,
        peer_rx: mpsc::Receiver<PeerEvent>,
        mediator: Arc<dyn SignalingMediator>,
        signal_rx: mpsc::Receiver<SignalingMessage>,
        render_sink: Arc<dyn RenderSink>,
        config: SessionConfig,
        cancel: CancellationToken,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        // Attaching the track fires the backend's negotiation-needed
        // trigger; the negotiation loop spawned below consumes it, so
        // the first offer always reflects the track.
        if let Err(e) = backend
            .add_video_track(&config.track, pipeline.subscribe())
            .await
        {
            error!("Session startup aborted: {}", e);
            cancel.cancel();
            let _ = backend.close().await;
            return Err(e);
        }

        let negotiator = Negotiator::new(backend.clone(), mediator, bus.clone(), render_sink);
        let state = negotiator.state_watch();
        let negotiation = tokio::spawn(negotiator.run(peer_rx, signal_rx, cancel.child_token()));

        info!("Session started");
        Ok(Self {
            cancel,
            bus,
            pipeline,
            backend,
            negotiation,
            state,
        })
    }

    /// Subscribe to diagnostics events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    /// Last observed negotiation state
    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Subscribe to the outgoing annotated stream
    pub fn outgoing_frames(&self) -> broadcast::Receiver<crate::video::frame::VideoFrame> {
        self.pipeline.subscribe()
    }

    /// Pipeline counters
    pub fn pipeline_stats(&self) -> PipelineStatsSnapshot {
        self.pipeline.stats()
    }

    /// Stop the pipeline and negotiation, close the peer connection
    pub async fn shutdown(self) -> Result<()> {
        info!("Session shutting down");
        self.cancel.cancel();
        let _ = self.negotiation.await;
        self.backend.close().await
    }
}
