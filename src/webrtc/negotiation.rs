//! Negotiation state machine
//!
//! Owns the offer/answer lifecycle over an abstract peer backend. All
//! triggers (local negotiation needs, discovered candidates, remote
//! messages) arrive through two channels and are dispatched through
//! one handler surface, so every transition is centrally auditable.
//!
//! Ordering rules enforced here:
//! - the offer is created only after the outgoing track is attached
//!   (the backend fires `NegotiationNeeded` on attach);
//! - the local description is set before any of its candidates are
//!   forwarded;
//! - remote candidates arriving before the remote description are
//!   buffered and flushed in arrival order once the answer is applied.
//!   Applying out of order is an error, not a silent drop.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::peer::{ConnectionState, PeerBackend, PeerEvent, RemoteStream, RenderSink};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::signaling::{IceCandidate, SignalingMediator, SignalingMessage};

/// Offer/answer progression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No offer outstanding
    Idle,
    /// Local offer applied and sent; awaiting the remote answer
    HaveLocalOffer,
    /// Remote answer applied; descriptions agree
    Stable,
}

/// Local ICE gathering sub-state (diagnostics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGathering {
    Gathering,
    Complete,
}

/// The negotiation state machine
///
/// Mutated only by its own event handlers; no other code touches the
/// peer connection's descriptions or candidate list.
pub struct Negotiator {
    backend: Arc<dyn PeerBackend>,
    mediator: Arc<dyn SignalingMediator>,
    bus: Arc<EventBus>,
    render_sink: Arc<dyn RenderSink>,
    state: NegotiationState,
    /// Mirrors `state` for observers outside the run loop
    state_tx: watch::Sender<NegotiationState>,
    gathering: IceGathering,
    connection: ConnectionState,
    /// Remote candidates received before the remote description
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    /// A negotiation need arrived while an offer was in flight
    offer_deferred: bool,
    remote_attached: bool,
}

impl Negotiator {
    pub fn new(
        backend: Arc<dyn PeerBackend>,
        mediator: Arc<dyn SignalingMediator>,
        bus: Arc<EventBus>,
        render_sink: Arc<dyn RenderSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(NegotiationState::Idle);
        Self {
            backend,
            mediator,
            bus,
            render_sink,
            state: NegotiationState::Idle,
            state_tx,
            gathering: IceGathering::Gathering,
            connection: ConnectionState::New,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            offer_deferred: false,
            remote_attached: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Watch negotiation state from outside the run loop
    pub fn state_watch(&self) -> watch::Receiver<NegotiationState> {
        self.state_tx.subscribe()
    }

    fn set_state(&mut self, state: NegotiationState) {
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    pub fn gathering(&self) -> IceGathering {
        self.gathering
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Number of buffered remote candidates awaiting the description
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Drive the machine until cancellation or both channels close
    pub async fn run(
        mut self,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
        mut signal_rx: mpsc::Receiver<SignalingMessage>,
        cancel: CancellationToken,
    ) {
        info!("Negotiation loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = peer_rx.recv() => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => break,
                },
                message = signal_rx.recv() => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => break,
                },
            }
        }
        info!("Negotiation loop stopped");
    }

    /// Dispatch one event from the peer backend
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded => {
                if let Err(e) = self.negotiate().await {
                    self.report(e);
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                // local description was set in negotiate() before the
                // backend could start gathering for it
                if let Err(e) = self
                    .mediator
                    .send(SignalingMessage::Ice { candidate })
                    .await
                {
                    self.report(e);
                }
            }
            PeerEvent::GatheringComplete => {
                self.gathering = IceGathering::Complete;
                debug!("Local ICE gathering complete");
                self.bus.publish(SessionEvent::GatheringComplete);
            }
            PeerEvent::RemoteTrack(stream) => self.attach_remote(stream),
            PeerEvent::ConnectionChanged(state) => {
                info!("Connection state: {}", state);
                self.connection = state;
                self.bus
                    .publish(SessionEvent::ConnectionChanged { state });
            }
        }
    }

    /// Dispatch one message from the signaling mediator
    pub async fn handle_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Answer { sdp } => {
                if let Err(e) = self.apply_answer(sdp).await {
                    self.report(e);
                }
            }
            SignalingMessage::Ice { candidate } => self.apply_remote_candidate(candidate).await,
            SignalingMessage::Offer { .. } => {
                // this end is always the offerer
                self.report(AppError::Negotiation(
                    "unexpected offer from remote peer".to_string(),
                ));
            }
        }
    }

    /// Create, apply and send a local offer
    ///
    /// At most one offer is ever in flight: a need arriving while one
    /// is underway is coalesced and replayed after the answer lands.
    async fn negotiate(&mut self) -> Result<()> {
        if self.state == NegotiationState::HaveLocalOffer {
            self.offer_deferred = true;
            debug!("Offer already in flight, negotiation need deferred");
            return Ok(());
        }

        let sdp = self.backend.create_offer().await?;
        self.backend.set_local_description(sdp.clone()).await?;
        self.set_state(NegotiationState::HaveLocalOffer);

        self.mediator.send(SignalingMessage::Offer { sdp }).await?;
        info!("Offer created and sent");
        self.bus.publish(SessionEvent::OfferSent);
        Ok(())
    }

    /// Validate and apply a remote answer
    async fn apply_answer(&mut self, sdp: String) -> Result<()> {
        if self.state != NegotiationState::HaveLocalOffer {
            return Err(AppError::Negotiation(format!(
                "answer received in {:?} state, not awaiting one",
                self.state
            )));
        }

        self.backend.set_remote_answer(sdp).await?;
        self.remote_description_set = true;
        self.set_state(NegotiationState::Stable);
        info!("Answer applied, negotiation stable");
        self.bus.publish(SessionEvent::AnswerApplied);

        self.flush_candidates().await;

        if self.offer_deferred {
            self.offer_deferred = false;
            debug!("Replaying deferred negotiation need");
            self.negotiate().await?;
        }
        Ok(())
    }

    /// Buffer or apply a remote candidate depending on description state
    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            debug!(
                "Remote candidate buffered ({} queued)",
                self.pending_candidates.len()
            );
            self.bus.publish(SessionEvent::CandidateBuffered {
                queued: self.pending_candidates.len(),
            });
            return;
        }

        if let Err(e) = self.backend.add_ice_candidate(candidate).await {
            self.report(e);
        }
    }

    /// Apply buffered candidates in arrival order
    ///
    /// An empty queue is a no-op. One failing candidate is reported and
    /// does not stop the rest from being applied.
    async fn flush_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }

        let mut applied = 0;
        while let Some(candidate) = self.pending_candidates.pop_front() {
            match self.backend.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => self.report(e),
            }
        }

        debug!("Flushed {} buffered candidates", applied);
        self.bus
            .publish(SessionEvent::CandidatesFlushed { applied });
    }

    /// Hand a remote stream to the render sink (last-write-wins)
    fn attach_remote(&mut self, stream: RemoteStream) {
        let replaced = self.remote_attached;
        self.remote_attached = true;
        self.render_sink.attach(stream);
        self.bus
            .publish(SessionEvent::RemoteStreamAttached { replaced });
    }

    /// Surface a rejected transition without tearing the session down
    fn report(&self, error: AppError) {
        warn!("Negotiation error: {}", error);
        self.bus.publish(SessionEvent::NegotiationFailed {
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::ChannelMediator;
    use crate::webrtc::track::TrackConfig;
    use crate::video::frame::VideoFrame;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    /// What the mock backend was asked to do, in order
    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        AddTrack,
        CreateOffer,
        SetLocal(String),
        SetRemoteAnswer(String),
        AddCandidate(String),
        Close,
    }

    /// Scripted peer backend recording every call
    #[derive(Default)]
    struct MockPeer {
        calls: Mutex<Vec<Call>>,
        fail_answer: bool,
    }

    impl MockPeer {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn offers_created(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::CreateOffer))
                .count()
        }

        fn candidates_applied(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::AddCandidate(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl PeerBackend for MockPeer {
        async fn add_video_track(
            &self,
            _config: &TrackConfig,
            _frames: broadcast::Receiver<VideoFrame>,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(Call::AddTrack);
            Ok(())
        }

        async fn create_offer(&self) -> Result<String> {
            self.calls.lock().unwrap().push(Call::CreateOffer);
            Ok("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n".to_string())
        }

        async fn set_local_description(&self, sdp: String) -> Result<()> {
            self.calls.lock().unwrap().push(Call::SetLocal(sdp));
            Ok(())
        }

        async fn set_remote_answer(&self, sdp: String) -> Result<()> {
            if self.fail_answer {
                return Err(AppError::Negotiation("description rejected".to_string()));
            }
            self.calls.lock().unwrap().push(Call::SetRemoteAnswer(sdp));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::AddCandidate(candidate.candidate));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Close);
            Ok(())
        }
    }

    /// Render sink recording attached streams
    #[derive(Default)]
    struct RecordingSink {
        streams: Mutex<Vec<RemoteStream>>,
    }

    impl RenderSink for RecordingSink {
        fn attach(&self, stream: RemoteStream) {
            self.streams.lock().unwrap().push(stream);
        }
    }

    struct Fixture {
        negotiator: Negotiator,
        backend: Arc<MockPeer>,
        sink: Arc<RecordingSink>,
        outbound: mpsc::Receiver<SignalingMessage>,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        fixture_with(MockPeer::default())
    }

    fn fixture_with(peer: MockPeer) -> Fixture {
        let backend = Arc::new(peer);
        let (mediator, outbound) = ChannelMediator::pair(32);
        let bus = Arc::new(EventBus::new());
        let sink = Arc::new(RecordingSink::default());
        let negotiator = Negotiator::new(
            backend.clone(),
            Arc::new(mediator),
            bus.clone(),
            sink.clone(),
        );
        Fixture {
            negotiator,
            backend,
            sink,
            outbound,
            bus,
        }
    }

    fn remote_candidate(name: &str) -> IceCandidate {
        IceCandidate::new(name).with_mid("0", 0)
    }

    #[tokio::test]
    async fn test_track_attach_produces_single_offer() {
        let mut f = fixture();

        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;

        assert_eq!(f.negotiator.state(), NegotiationState::HaveLocalOffer);
        assert_eq!(f.backend.offers_created(), 1);
        assert!(matches!(
            f.outbound.try_recv(),
            Ok(SignalingMessage::Offer { .. })
        ));

        // local description set before the offer went out
        let calls = f.backend.calls();
        assert!(matches!(calls[0], Call::CreateOffer));
        assert!(matches!(calls[1], Call::SetLocal(_)));
    }

    #[tokio::test]
    async fn test_concurrent_needs_are_coalesced() {
        let mut f = fixture();

        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;
        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;
        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;

        // still exactly one offer in flight
        assert_eq!(f.backend.offers_created(), 1);
        assert!(matches!(
            f.outbound.try_recv(),
            Ok(SignalingMessage::Offer { .. })
        ));
        assert!(f.outbound.try_recv().is_err());

        // the deferred need replays once the answer lands
        f.negotiator
            .handle_signal(SignalingMessage::Answer { sdp: "v=0".into() })
            .await;
        assert_eq!(f.backend.offers_created(), 2);
    }

    #[tokio::test]
    async fn test_answer_in_idle_is_rejected() {
        let mut f = fixture();
        let mut events = f.bus.subscribe();

        f.negotiator
            .handle_signal(SignalingMessage::Answer { sdp: "v=0".into() })
            .await;

        // no transition, no backend call, error reported
        assert_eq!(f.negotiator.state(), NegotiationState::Idle);
        assert!(f.backend.calls().is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::NegotiationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_early_candidates_buffered_and_flushed_in_order() {
        let mut f = fixture();

        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;

        // candidates race ahead of the answer
        for name in ["c1", "c2", "c3"] {
            f.negotiator
                .handle_signal(SignalingMessage::Ice {
                    candidate: remote_candidate(name),
                })
                .await;
        }
        assert_eq!(f.negotiator.buffered_candidates(), 3);
        assert!(f.backend.candidates_applied().is_empty());

        f.negotiator
            .handle_signal(SignalingMessage::Answer { sdp: "v=0".into() })
            .await;

        // all applied, in arrival order, none dropped
        assert_eq!(f.backend.candidates_applied(), vec!["c1", "c2", "c3"]);
        assert_eq!(f.negotiator.buffered_candidates(), 0);

        // later candidates apply directly
        f.negotiator
            .handle_signal(SignalingMessage::Ice {
                candidate: remote_candidate("c4"),
            })
            .await;
        assert_eq!(f.backend.candidates_applied().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let mut f = fixture();
        let mut events = f.bus.subscribe();

        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;
        f.negotiator
            .handle_signal(SignalingMessage::Answer { sdp: "v=0".into() })
            .await;

        assert_eq!(f.backend.candidates_applied().len(), 0);
        // OfferSent then AnswerApplied; no CandidatesFlushed event
        assert!(matches!(events.try_recv(), Ok(SessionEvent::OfferSent)));
        assert!(matches!(events.try_recv(), Ok(SessionEvent::AnswerApplied)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_answer_leaves_state_unchanged() {
        let mut f = fixture_with(MockPeer {
            fail_answer: true,
            ..Default::default()
        });

        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;
        f.negotiator
            .handle_signal(SignalingMessage::Answer { sdp: "bogus".into() })
            .await;

        assert_eq!(f.negotiator.state(), NegotiationState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_remote_track_populates_render_sink() {
        let mut f = fixture();

        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;
        f.negotiator
            .handle_signal(SignalingMessage::Answer { sdp: "v=0".into() })
            .await;
        assert_eq!(f.negotiator.state(), NegotiationState::Stable);

        let stream = RemoteStream {
            stream_id: "remote".into(),
            track_id: "video0".into(),
            mime_type: "video/VP8".into(),
        };
        f.negotiator
            .handle_peer_event(PeerEvent::RemoteTrack(stream.clone()))
            .await;
        assert_eq!(f.sink.streams.lock().unwrap().as_slice(), &[stream.clone()]);

        // a second stream replaces the first, last-write-wins
        let second = RemoteStream {
            stream_id: "remote2".into(),
            ..stream
        };
        f.negotiator
            .handle_peer_event(PeerEvent::RemoteTrack(second.clone()))
            .await;
        assert_eq!(f.sink.streams.lock().unwrap().last(), Some(&second));
    }

    #[tokio::test]
    async fn test_end_of_gathering_sentinel_not_forwarded() {
        let mut f = fixture();

        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;
        let _ = f.outbound.try_recv(); // drop the offer

        f.negotiator
            .handle_peer_event(PeerEvent::GatheringComplete)
            .await;

        assert_eq!(f.negotiator.gathering(), IceGathering::Complete);
        assert!(f.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_happy_path() {
        // attach -> offer -> answer -> candidates both ways -> connected
        let mut f = fixture();

        f.negotiator
            .handle_peer_event(PeerEvent::NegotiationNeeded)
            .await;

        let offer = f.outbound.try_recv().unwrap();
        let sdp = match offer {
            SignalingMessage::Offer { sdp } => sdp,
            other => panic!("expected offer, got {:?}", other),
        };
        // exactly one media section for the single video track
        assert_eq!(sdp.matches("m=").count(), 1);

        f.negotiator
            .handle_signal(SignalingMessage::Answer { sdp: "v=0".into() })
            .await;
        assert_eq!(f.negotiator.state(), NegotiationState::Stable);

        // two local candidates are forwarded through the mediator
        for name in ["local1", "local2"] {
            f.negotiator
                .handle_peer_event(PeerEvent::LocalCandidate(remote_candidate(name)))
                .await;
        }
        let mut forwarded = vec![];
        while let Ok(msg) = f.outbound.try_recv() {
            if let SignalingMessage::Ice { candidate } = msg {
                forwarded.push(candidate.candidate);
            }
        }
        assert_eq!(forwarded, vec!["local1", "local2"]);

        // one remote candidate applied directly
        f.negotiator
            .handle_signal(SignalingMessage::Ice {
                candidate: remote_candidate("remote1"),
            })
            .await;
        assert_eq!(f.backend.candidates_applied(), vec!["remote1"]);

        f.negotiator
            .handle_peer_event(PeerEvent::ConnectionChanged(ConnectionState::Connected))
            .await;
        assert_eq!(f.negotiator.connection(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_run_loop_cancellation() {
        let f = fixture();
        let (_peer_tx, peer_rx) = mpsc::channel(4);
        let (_signal_tx, signal_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(f.negotiator.run(peer_rx, signal_rx, cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
    }
}
