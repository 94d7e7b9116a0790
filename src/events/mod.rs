//! Diagnostics event bus
//!
//! Every protocol rejection, state observation and pipeline degradation
//! is published here. Events carry information only; nothing in this
//! crate reacts to them (no auto-retry, no reconnection). Reacting is
//! left to whoever subscribes.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::webrtc::peer::ConnectionState;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Diagnostics events emitted over a session's lifetime
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Frame pipeline is up and producing the outgoing stream
    PipelineStarted,
    /// The draw loop ended because the frame source failed
    PipelineStopped { reason: String },
    /// A local offer was created, applied and sent
    OfferSent,
    /// A remote answer was validated and applied; negotiation is stable
    AnswerApplied,
    /// A negotiation step was rejected or failed
    NegotiationFailed { reason: String },
    /// A remote candidate arrived before the remote description; buffered
    CandidateBuffered { queued: usize },
    /// Buffered candidates were applied after the remote description
    CandidatesFlushed { applied: usize },
    /// A remote stream was handed to the render sink
    RemoteStreamAttached { replaced: bool },
    /// Local ICE gathering finished
    GatheringComplete,
    /// Connection liveness observation (informational only)
    ConnectionChanged { state: ConnectionState },
    /// A per-frame detection failed; the raw frame was emitted instead
    DetectorDegraded { reason: String },
}

/// Broadcast bus for session diagnostics
///
/// Fire-and-forget: publishing with no subscribers drops the event. A
/// subscriber that falls too far behind sees a `Lagged` error and
/// misses events.
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: SessionEvent) {
        // send returns Err with no subscribers, which is normal
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::OfferSent);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::OfferSent));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(SessionEvent::NegotiationFailed {
            reason: "test".to_string(),
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            SessionEvent::NegotiationFailed { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            SessionEvent::NegotiationFailed { .. }
        ));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);

        // must not panic with nobody listening
        bus.publish(SessionEvent::GatheringComplete);
    }
}
