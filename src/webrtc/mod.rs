//! Peer connection, negotiation and outgoing track

pub mod config;
pub mod negotiation;
pub mod peer;
pub mod track;

pub use config::{TurnServer, WebRtcConfig};
pub use negotiation::{IceGathering, NegotiationState, Negotiator};
pub use peer::{ConnectionState, PeerBackend, PeerEvent, RemoteStream, RenderSink, RtcPeer};
pub use track::{TrackConfig, VideoCodecType, VideoTrack};
