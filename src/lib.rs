//! PeerLens - annotated-video WebRTC publishing client
//!
//! Captures a local video stream, runs each frame through a pluggable
//! face detector to produce an annotated output stream, and negotiates
//! a peer-to-peer media session over an external signaling channel,
//! publishing the annotated stream and handing the remote stream to a
//! render sink.

pub mod detect;
pub mod error;
pub mod events;
pub mod session;
pub mod signaling;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
pub use session::{Session, SessionConfig};
