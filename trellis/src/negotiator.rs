//! Drives offer/answer/ICE exchange for one engine session.
//!
//! The signaling channel gives no ordering guarantee across message types,
//! so the negotiator has to absorb duplicate offers, offers that arrive
//! while a previous one is still being applied, and renegotiation signals
//! fired more than once for a single logical change.

use crate::engine::{
    DataChannelConfig, EngineEvent, MediaStream, OfferOptions, SessionEngine,
};
use crate::error::Error;
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, warn};
use trellis_core::model::{ConnectionType, IceCandidateInit, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the first offer.
    Originator,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    CreatingOffer,
    AwaitingAnswer,
    ApplyingRemoteOffer,
    CreatingAnswer,
    Stable,
    Closed,
}

#[derive(Debug)]
pub enum NegotiatorEvent {
    OfferReady(SessionDescription),
    AnswerReady(SessionDescription),
    CandidateReady(IceCandidateInit),
    StreamAdded(MediaStream),
    StreamRemoved(String),
    ChannelOpen,
    DataReceived(Bytes),
    SessionBroken,
}

/// What `start` should set up on the engine before the first exchange.
pub struct NegotiatorConfig {
    pub kind: ConnectionType,
    pub local_stream: Option<MediaStream>,
    /// Required for the answerer role: the remote offer to process
    /// immediately.
    pub remote_offer: Option<SessionDescription>,
    pub label: String,
    pub channel: DataChannelConfig,
    pub offer_options: OfferOptions,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            kind: ConnectionType::Data,
            local_stream: None,
            remote_offer: None,
            label: String::new(),
            channel: DataChannelConfig::default(),
            offer_options: OfferOptions::default(),
        }
    }
}

pub struct Negotiator {
    role: Role,
    state: NegotiationState,
    engine: Box<dyn SessionEngine>,
    /// Offers received while a previous remote offer was mid-application.
    /// Replayed FIFO once stable again; trades strict per-offer ordering
    /// for no-offer-loss.
    offer_queue: VecDeque<SessionDescription>,
    last_offer: Option<SessionDescription>,
    /// Set when a stream swap needs a renegotiation pass; the only path on
    /// which a non-originator honors a renegotiation signal.
    replace_stream_requested: bool,
    has_remote_description: bool,
    offer_options: OfferOptions,
}

impl Negotiator {
    pub fn new(role: Role, engine: Box<dyn SessionEngine>) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            engine,
            offer_queue: VecDeque::new(),
            last_offer: None,
            replace_stream_requested: false,
            has_remote_description: false,
            offer_options: OfferOptions::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    /// Set up the engine session and run the role's first exchange step.
    pub async fn start(
        &mut self,
        config: NegotiatorConfig,
    ) -> Result<Vec<NegotiatorEvent>, Error> {
        self.offer_options = config.offer_options;

        match config.kind {
            ConnectionType::Data => {
                if self.role == Role::Originator {
                    self.engine
                        .create_data_channel(&config.label, &config.channel)
                        .await?;
                }
            }
            ConnectionType::Media => match &config.local_stream {
                Some(stream) => self.engine.add_stream(stream).await?,
                None => self.engine.receive_media().await?,
            },
        }

        match self.role {
            Role::Originator => self.negotiate().await,
            Role::Answerer => {
                let offer = config.remote_offer.ok_or_else(|| {
                    Error::validation("answerer started without a remote offer")
                })?;
                self.handle_offer(offer).await
            }
        }
    }

    /// Create a local offer and apply it. Failure rolls the state machine
    /// back so a later signal can retry.
    async fn negotiate(&mut self) -> Result<Vec<NegotiatorEvent>, Error> {
        let resume = self.state;
        self.state = NegotiationState::CreatingOffer;

        let result: Result<SessionDescription, Error> = async {
            let offer = self.engine.create_offer(&self.offer_options).await?;
            self.engine.set_local_description(offer.clone()).await?;
            Ok(offer)
        }
        .await;

        match result {
            Ok(offer) => {
                self.state = NegotiationState::AwaitingAnswer;
                Ok(vec![NegotiatorEvent::OfferReady(offer)])
            }
            Err(e) => {
                self.state = resume;
                Err(e)
            }
        }
    }

    pub async fn handle_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<Vec<NegotiatorEvent>, Error> {
        if self.state == NegotiationState::Closed {
            debug!("offer after cleanup, dropping");
            return Ok(Vec::new());
        }
        // Duplicate renegotiation signals reuse the exact same blob.
        if self.last_offer.as_ref() == Some(&offer) {
            debug!("duplicate offer, ignoring");
            return Ok(Vec::new());
        }
        // A crossing offer while our own is outstanding, or one that lands
        // mid-apply, waits its turn in the queue.
        if matches!(
            self.state,
            NegotiationState::AwaitingAnswer
                | NegotiationState::ApplyingRemoteOffer
                | NegotiationState::CreatingAnswer
        ) {
            self.offer_queue.push_back(offer);
            return Ok(Vec::new());
        }

        let mut events = self.apply_remote_offer(offer).await?;
        // Replay offers that beat us here while the previous apply ran.
        while self.state == NegotiationState::Stable {
            let Some(queued) = self.offer_queue.pop_front() else { break };
            if self.last_offer.as_ref() == Some(&queued) {
                continue;
            }
            events.extend(self.apply_remote_offer(queued).await?);
        }
        Ok(events)
    }

    async fn apply_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<Vec<NegotiatorEvent>, Error> {
        let resume = self.state;
        self.state = NegotiationState::ApplyingRemoteOffer;

        let result: Result<SessionDescription, Error> = async {
            self.engine.set_remote_description(offer.clone()).await?;
            self.has_remote_description = true;
            self.state = NegotiationState::CreatingAnswer;
            let answer = self.engine.create_answer().await?;
            self.engine.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;

        match result {
            Ok(answer) => {
                self.last_offer = Some(offer);
                self.state = NegotiationState::Stable;
                Ok(vec![NegotiatorEvent::AnswerReady(answer)])
            }
            Err(e) => {
                self.state = resume;
                Err(e)
            }
        }
    }

    pub async fn handle_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<Vec<NegotiatorEvent>, Error> {
        if self.state == NegotiationState::AwaitingAnswer {
            self.engine.set_remote_description(answer).await?;
            self.has_remote_description = true;
            self.state = NegotiationState::Stable;

            // An offer may have crossed ours; it queued while we were
            // awaiting and gets replayed now.
            let mut events = Vec::new();
            while self.state == NegotiationState::Stable {
                let Some(queued) = self.offer_queue.pop_front() else { break };
                if self.last_offer.as_ref() == Some(&queued) {
                    continue;
                }
                events.extend(self.apply_remote_offer(queued).await?);
            }
            return Ok(events);
        }

        // Not expecting an answer: an externally-triggered renegotiation
        // request, honored only for a pending stream swap.
        if self.replace_stream_requested && self.state == NegotiationState::Stable {
            self.replace_stream_requested = false;
            return self.negotiate().await;
        }
        warn!("unexpected answer in state {:?}, ignoring", self.state);
        Ok(Vec::new())
    }

    /// Candidate application failures are logged, never fatal.
    pub async fn handle_candidate(&mut self, candidate: IceCandidateInit) -> Vec<NegotiatorEvent> {
        if self.state == NegotiationState::Closed {
            return Vec::new();
        }
        if let Err(e) = self.engine.add_ice_candidate(candidate).await {
            warn!("failed to add ICE candidate: {e}");
        }
        Vec::new()
    }

    pub async fn handle_engine_event(
        &mut self,
        event: EngineEvent,
    ) -> Result<Vec<NegotiatorEvent>, Error> {
        if self.state == NegotiationState::Closed {
            return Ok(Vec::new());
        }
        match event {
            EngineEvent::IceCandidate(c) => Ok(vec![NegotiatorEvent::CandidateReady(c)]),
            EngineEvent::StreamAdded(s) => Ok(vec![NegotiatorEvent::StreamAdded(s)]),
            EngineEvent::StreamRemoved(id) => Ok(vec![NegotiatorEvent::StreamRemoved(id)]),
            EngineEvent::DataChannelOpen => Ok(vec![NegotiatorEvent::ChannelOpen]),
            EngineEvent::DataReceived(b) => Ok(vec![NegotiatorEvent::DataReceived(b)]),
            EngineEvent::Broken => Ok(vec![NegotiatorEvent::SessionBroken]),
            EngineEvent::NegotiationNeeded => {
                // Gate: only honored in a stable state with no renegotiation
                // in flight. The engine fires this more than once for a
                // single logical change (multiple simultaneous track
                // additions); extra signals are dropped here.
                if self.state != NegotiationState::Stable {
                    debug!("renegotiation signal in {:?}, dropping", self.state);
                    return Ok(Vec::new());
                }
                match self.role {
                    Role::Originator => self.negotiate().await,
                    Role::Answerer => {
                        if self.replace_stream_requested {
                            self.replace_stream_requested = false;
                            self.negotiate().await
                        } else {
                            debug!("renegotiation signal on answerer without stream swap, dropping");
                            Ok(Vec::new())
                        }
                    }
                }
            }
        }
    }

    /// Swap outgoing media. Per-track replacement avoids renegotiation
    /// entirely; otherwise fall back to remove/add and let the (serialized,
    /// `&mut self`) renegotiation pass pick it up.
    pub async fn replace_stream(
        &mut self,
        old: Option<&MediaStream>,
        new: &MediaStream,
    ) -> Result<Vec<NegotiatorEvent>, Error> {
        if self.state == NegotiationState::Closed {
            return Ok(Vec::new());
        }
        if self.engine.replace_track(new).await? {
            return Ok(Vec::new());
        }

        if let Some(old) = old {
            self.engine.remove_stream(old).await?;
        }
        self.engine.add_stream(new).await?;
        self.replace_stream_requested = true;

        if self.role == Role::Originator && self.state == NegotiationState::Stable {
            self.replace_stream_requested = false;
            return self.negotiate().await;
        }
        Ok(Vec::new())
    }

    pub async fn send_data(&mut self, data: Bytes) -> Result<(), crate::engine::EngineError> {
        self.engine.send_data(data).await
    }

    /// Release the engine session. Safe to call more than once.
    pub async fn cleanup(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.offer_queue.clear();
        if let Err(e) = self.engine.close().await {
            warn!("engine close failed: {e}");
        }
    }
}
