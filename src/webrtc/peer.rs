//! Peer connection backend
//!
//! The negotiation state machine never touches a peer connection
//! directly; it drives a [`PeerBackend`] and reacts to the
//! [`PeerEvent`]s the backend pushes. [`RtcPeer`] is the production
//! backend over webrtc-rs; tests substitute a scripted one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::config::WebRtcConfig;
use super::track::{TrackConfig, VideoTrack};
use crate::error::{AppError, Result};
use crate::signaling::IceCandidate;
use crate::video::frame::VideoFrame;

/// Observed connection liveness, surfaced for diagnostics only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Reference to an inbound remote stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub mime_type: String,
}

/// External surface a remote stream is displayed on
pub trait RenderSink: Send + Sync {
    /// Hand over the remote stream; replaces any previous source
    fn attach(&self, stream: RemoteStream);
}

/// Events pushed by a peer backend into the negotiation state machine
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A (re)negotiation is needed, typically after a track was attached
    NegotiationNeeded,
    /// A local ICE candidate was discovered
    LocalCandidate(IceCandidate),
    /// Local candidate gathering finished (the null-candidate sentinel)
    GatheringComplete,
    /// A remote track arrived
    RemoteTrack(RemoteStream),
    /// Connection liveness changed
    ConnectionChanged(ConnectionState),
}

/// Operations the negotiation state machine needs from a peer connection
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Attach the outgoing annotated stream as a video track
    ///
    /// Must fire [`PeerEvent::NegotiationNeeded`] so the offer created
    /// afterwards reflects the track's media section.
    async fn add_video_track(
        &self,
        config: &TrackConfig,
        frames: broadcast::Receiver<VideoFrame>,
    ) -> Result<()>;

    /// Create an SDP offer for the current track set
    async fn create_offer(&self) -> Result<String>;

    /// Apply a local offer as the local description
    async fn set_local_description(&self, sdp: String) -> Result<()>;

    /// Apply a remote answer as the remote description
    async fn set_remote_answer(&self, sdp: String) -> Result<()>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Close the connection and release media
    async fn close(&self) -> Result<()>;
}

/// Production peer backend over webrtc-rs
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    video_track: RwLock<Option<VideoTrack>>,
}

impl RtcPeer {
    /// Create a peer connection and wire its callbacks into `events`
    pub async fn new(config: &WebRtcConfig, events: mpsc::Sender<PeerEvent>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        for stun_url in &config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        let peer = Self {
            pc,
            video_track: RwLock::new(None),
        };
        peer.register_handlers(events);

        Ok(peer)
    }

    /// Forward connection callbacks into the event channel
    ///
    /// Transitions are handled centrally by the negotiator, never in
    /// the callbacks themselves.
    fn register_handlers(&self, events: mpsc::Sender<PeerEvent>) {
        let tx = events.clone();
        self.pc
            .on_negotiation_needed(Box::new(move || {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(PeerEvent::NegotiationNeeded).await;
                })
            }));

        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    match candidate {
                        Some(c) => match c.to_json() {
                            Ok(init) => {
                                debug!("Local ICE candidate: {}", init.candidate);
                                let _ = tx
                                    .send(PeerEvent::LocalCandidate(IceCandidate {
                                        candidate: init.candidate,
                                        sdp_mid: init.sdp_mid,
                                        sdp_mline_index: init.sdp_mline_index,
                                        username_fragment: init.username_fragment,
                                    }))
                                    .await;
                            }
                            Err(e) => warn!("Unserializable ICE candidate: {}", e),
                        },
                        // null candidate only marks local end of gathering
                        None => {
                            let _ = tx.send(PeerEvent::GatheringComplete).await;
                        }
                    }
                })
            }));

        let tx = events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let stream = RemoteStream {
                        stream_id: track.stream_id(),
                        track_id: track.id(),
                        mime_type: track.codec().capability.mime_type.clone(),
                    };
                    info!(
                        "Remote track received: {} ({})",
                        stream.track_id, stream.mime_type
                    );
                    let _ = tx.send(PeerEvent::RemoteTrack(stream)).await;
                })
            },
        ));

        let tx = events;
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };
                    let _ = tx.send(PeerEvent::ConnectionChanged(state)).await;
                })
            }));
    }
}

#[async_trait]
impl PeerBackend for RtcPeer {
    async fn add_video_track(
        &self,
        config: &TrackConfig,
        frames: broadcast::Receiver<VideoFrame>,
    ) -> Result<()> {
        let track = VideoTrack::new(config);

        self.pc
            .add_track(track.sample_track())
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to add video track: {}", e)))?;

        track.start_sending(frames);
        *self.video_track.write().await = Some(track);
        info!("Video track added to peer connection");

        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: String) -> Result<()> {
        let desc = RTCSessionDescription::offer(sdp)
            .map_err(|e| AppError::Negotiation(format!("Invalid local offer: {}", e)))?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let desc = RTCSessionDescription::answer(sdp)
            .map_err(|e| AppError::Negotiation(format!("Invalid SDP answer: {}", e)))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if let Some(track) = self.video_track.write().await.take() {
            track.stop();
        }
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}
