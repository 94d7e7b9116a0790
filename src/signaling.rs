//! Signaling types and the mediator interface
//!
//! The mediator is an abstract bidirectional channel to the remote
//! party. The transport itself (WebSocket, server push, whatever) lives
//! outside this crate; the session only sees tagged messages. Arrival
//! order is preserved per message type but never across types, which is
//! why the negotiator buffers early ICE candidates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{AppError, Result};

/// Signaling message exchanged with the remote peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// SDP offer (outbound: we are always the offerer)
    Offer { sdp: String },
    /// SDP answer from the remote peer
    Answer { sdp: String },
    /// Trickled ICE candidate, either direction
    Ice { candidate: IceCandidate },
}

/// ICE candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Outbound half of the signaling channel
///
/// Inbound messages are delivered to the session as an
/// `mpsc::Receiver<SignalingMessage>` supplied at startup.
#[async_trait]
pub trait SignalingMediator: Send + Sync {
    /// Push one message toward the remote party
    async fn send(&self, message: SignalingMessage) -> Result<()>;
}

/// In-process mediator backed by an mpsc channel
///
/// Used by tests and by hosts that bridge signaling themselves: the
/// session sends into the channel, the host forwards from the receiver
/// to its real transport.
pub struct ChannelMediator {
    tx: mpsc::Sender<SignalingMessage>,
}

impl ChannelMediator {
    /// Create a mediator plus the receiver for its outbound messages
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<SignalingMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SignalingMediator for ChannelMediator {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| AppError::Signaling("signaling channel closed".to_string()))
    }
}
