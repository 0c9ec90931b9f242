//! Point-to-point sessions. A connection owns one negotiator and queues
//! signaling that arrives before the negotiator is ready; the data and
//! media variants add their per-kind payload handling on top.

use crate::engine::MediaStream;
use crate::error::Error;
use crate::negotiator::{NegotiationState, Negotiator, NegotiatorConfig, NegotiatorEvent};
use std::collections::VecDeque;
use tracing::{debug, warn};
use trellis_core::model::{
    ClientMessage, ConnectionId, ConnectionType, DataPayload, Envelope, IceCandidateInit, PeerId,
    RoomName, Serialization, SessionDescription,
};

mod data;
mod media;

pub use data::{DataConnection, DataConnectionOptions};
pub use media::{MediaConnection, MediaConnectionOptions};

/// Signaling that arrived before this connection could apply it.
#[derive(Debug)]
pub enum PendingMessage {
    Answer(SessionDescription),
    Candidate(IceCandidateInit),
}

/// Upper bound on messages parked while the negotiator is absent. Inbound
/// signaling is at-least-once, so dropping the oldest under pressure is
/// safe.
const QUEUED_MESSAGE_LIMIT: usize = 64;

#[derive(Debug)]
pub enum ConnectionEvent {
    /// The session reached a usable state (channel open / media flowing).
    Open,
    /// Outbound signaling for the control loop to envelope and send.
    SignalOffer(SessionDescription),
    SignalAnswer(SessionDescription),
    SignalCandidate(IceCandidateInit),
    /// A fully reassembled inbound payload.
    Data(DataPayload),
    Stream(MediaStream),
    StreamRemoved(String),
    Closed,
    /// The caller asked for the remote mirror to be torn down explicitly.
    ForceClose,
    /// The data send queue has work; the control loop should drain it.
    DrainRequested,
    /// The channel pushed back mid-drain; retry after a short delay
    /// instead of spinning on the busy channel.
    RetryDrain,
    Error(Error),
}

/// State shared by both connection kinds.
pub struct ConnectionCore {
    pub(crate) id: ConnectionId,
    pub(crate) remote_id: PeerId,
    pub(crate) kind: ConnectionType,
    pub(crate) metadata: Option<serde_json::Value>,
    /// True when this side initiated the session. Fixed at creation; the
    /// candidate-before-remote-description gate applies to this side only.
    pub(crate) originator: bool,
    pub(crate) open: bool,
    pub(crate) closed: bool,
    pub(crate) negotiator: Option<Negotiator>,
    pub(crate) queued: VecDeque<PendingMessage>,
    pub(crate) pending_offer: Option<SessionDescription>,
}

impl ConnectionCore {
    fn new(
        remote_id: PeerId,
        kind: ConnectionType,
        id: Option<ConnectionId>,
        metadata: Option<serde_json::Value>,
        originator: bool,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| ConnectionId::generate(kind)),
            remote_id,
            kind,
            metadata,
            originator,
            open: false,
            closed: false,
            negotiator: None,
            queued: VecDeque::new(),
            pending_offer: None,
        }
    }

    fn queue(&mut self, msg: PendingMessage) {
        if self.queued.len() >= QUEUED_MESSAGE_LIMIT {
            warn!("queued-message limit reached on {}, dropping oldest", self.id);
            self.queued.pop_front();
        }
        self.queued.push_back(msg);
    }

    /// Returns true when the connection transitioned to open.
    fn mark_open(&mut self) -> bool {
        if self.open || self.closed {
            return false;
        }
        self.open = true;
        true
    }
}

/// Closed set of connection kinds behind one interface; the peer and room
/// layers stay generic over the variant.
pub enum Connection {
    Data(DataConnection),
    Media(MediaConnection),
}

impl Connection {
    pub fn core(&self) -> &ConnectionCore {
        match self {
            Self::Data(c) => &c.core,
            Self::Media(c) => &c.core,
        }
    }

    fn core_mut(&mut self) -> &mut ConnectionCore {
        match self {
            Self::Data(c) => &mut c.core,
            Self::Media(c) => &mut c.core,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.core().id
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.core().remote_id
    }

    pub fn kind(&self) -> ConnectionType {
        self.core().kind
    }

    pub fn is_open(&self) -> bool {
        self.core().open
    }

    pub fn is_closed(&self) -> bool {
        self.core().closed
    }

    pub fn is_originator(&self) -> bool {
        self.core().originator
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.core().metadata.as_ref()
    }

    pub fn as_data(&self) -> Option<&DataConnection> {
        match self {
            Self::Data(c) => Some(c),
            Self::Media(_) => None,
        }
    }

    pub fn as_media(&self) -> Option<&MediaConnection> {
        match self {
            Self::Media(c) => Some(c),
            Self::Data(_) => None,
        }
    }

    pub fn as_media_mut(&mut self) -> Option<&mut MediaConnection> {
        match self {
            Self::Media(c) => Some(c),
            Self::Data(_) => None,
        }
    }

    /// Stash the initial remote offer so `attach_negotiator` can process it.
    pub fn stash_offer(&mut self, offer: SessionDescription) {
        self.core_mut().pending_offer = Some(offer);
    }

    pub fn take_pending_offer(&mut self) -> Option<SessionDescription> {
        self.core_mut().pending_offer.take()
    }

    /// Attach the negotiator, run its first exchange step and drain every
    /// message that was queued while it did not exist. The drain happens
    /// exactly once here; later answers re-trigger it opportunistically.
    pub async fn attach_negotiator(
        &mut self,
        mut negotiator: Negotiator,
        config: NegotiatorConfig,
    ) -> Vec<ConnectionEvent> {
        if self.core().negotiator.is_some() {
            warn!("negotiator already attached to {}, ignoring", self.id());
            return Vec::new();
        }
        let started = negotiator.start(config).await;
        self.core_mut().negotiator = Some(negotiator);

        let mut out = match started {
            Ok(events) => self.absorb(events).await,
            Err(e) => vec![ConnectionEvent::Error(e)],
        };
        out.extend(self.drain_queued().await);
        out
    }

    /// Renegotiation offer for an already-established session, or the
    /// pending initial offer when the session is still settling.
    pub async fn update_offer(&mut self, offer: SessionDescription) -> Vec<ConnectionEvent> {
        if self.is_open()
            && let Some(negotiator) = self.core_mut().negotiator.as_mut()
        {
            let result = negotiator.handle_offer(offer).await;
            return self.settle(result).await;
        }
        self.stash_offer(offer);
        Vec::new()
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Vec<ConnectionEvent> {
        if self.core().negotiator.is_none() {
            self.core_mut().queue(PendingMessage::Answer(answer));
            return Vec::new();
        }
        let mut out = self.apply_answer(answer).await;
        out.extend(self.drain_queued().await);
        out
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Vec<ConnectionEvent> {
        let Some(negotiator) = self.core_mut().negotiator.as_mut() else {
            return Vec::new();
        };
        let was_awaiting = negotiator.state() == NegotiationState::AwaitingAnswer;
        let result = negotiator.handle_answer(answer).await;
        let applied = was_awaiting && result.is_ok();
        let mut out = self.settle(result).await;
        // The originator's media session is usable once the remote answer
        // actually lands; an answer the engine rejected or the negotiator
        // ignored must not open the connection.
        if applied && matches!(self, Self::Media(_)) && self.core_mut().mark_open() {
            out.insert(0, ConnectionEvent::Open);
        }
        out
    }

    /// The originator must not apply a candidate before a remote
    /// description exists; queue in that window regardless of negotiator
    /// readiness.
    pub async fn handle_candidate(&mut self, candidate: IceCandidateInit) -> Vec<ConnectionEvent> {
        if self.candidate_gated() {
            self.core_mut().queue(PendingMessage::Candidate(candidate));
            return Vec::new();
        }
        if let Some(negotiator) = self.core_mut().negotiator.as_mut() {
            negotiator.handle_candidate(candidate).await;
        }
        Vec::new()
    }

    fn candidate_gated(&self) -> bool {
        match self.core().negotiator.as_ref() {
            None => true,
            Some(n) => self.core().originator && !n.has_remote_description(),
        }
    }

    async fn drain_queued(&mut self) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        let mut kept = VecDeque::new();
        let pending: Vec<PendingMessage> =
            self.core_mut().queued.drain(..).collect();
        for msg in pending {
            match msg {
                PendingMessage::Answer(answer) => {
                    out.extend(self.apply_answer(answer).await);
                }
                PendingMessage::Candidate(candidate) => {
                    if self.candidate_gated() {
                        kept.push_back(PendingMessage::Candidate(candidate));
                    } else if let Some(negotiator) = self.core_mut().negotiator.as_mut() {
                        negotiator.handle_candidate(candidate).await;
                    }
                }
            }
        }
        self.core_mut().queued = kept;
        out
    }

    pub async fn handle_engine_event(
        &mut self,
        event: crate::engine::EngineEvent,
    ) -> Vec<ConnectionEvent> {
        let Some(negotiator) = self.core_mut().negotiator.as_mut() else {
            debug!("engine event before negotiator attach, dropping");
            return Vec::new();
        };
        let result = negotiator.handle_engine_event(event).await;
        self.settle(result).await
    }

    async fn settle(
        &mut self,
        result: Result<Vec<NegotiatorEvent>, Error>,
    ) -> Vec<ConnectionEvent> {
        match result {
            Ok(events) => self.absorb(events).await,
            Err(e) => vec![ConnectionEvent::Error(e)],
        }
    }

    async fn absorb(&mut self, events: Vec<NegotiatorEvent>) -> Vec<ConnectionEvent> {
        let mut out = Vec::new();
        for event in events {
            match event {
                NegotiatorEvent::OfferReady(offer) => {
                    out.push(ConnectionEvent::SignalOffer(offer));
                }
                NegotiatorEvent::AnswerReady(answer) => {
                    // The answerer's media session is usable once it has
                    // produced an answer; data waits for the channel.
                    if matches!(self, Self::Media(_)) && self.core_mut().mark_open() {
                        out.push(ConnectionEvent::Open);
                    }
                    out.push(ConnectionEvent::SignalAnswer(answer));
                }
                NegotiatorEvent::CandidateReady(candidate) => {
                    out.push(ConnectionEvent::SignalCandidate(candidate));
                }
                NegotiatorEvent::ChannelOpen => {
                    if self.core_mut().mark_open() {
                        out.push(ConnectionEvent::Open);
                    }
                    if let Self::Data(c) = self
                        && !c.send_queue_is_empty()
                    {
                        out.push(ConnectionEvent::DrainRequested);
                    }
                }
                NegotiatorEvent::DataReceived(bytes) => {
                    if let Self::Data(c) = self {
                        out.extend(c.handle_incoming(bytes));
                    }
                }
                NegotiatorEvent::StreamAdded(stream) => {
                    if let Self::Media(c) = self {
                        // The engine can report the same stream twice.
                        if c.remote_stream.as_ref().map(MediaStream::id) == Some(stream.id()) {
                            debug!("duplicate remote stream {}, suppressing", stream.id());
                            continue;
                        }
                        c.remote_stream = Some(stream.clone());
                        if c.core.mark_open() {
                            out.push(ConnectionEvent::Open);
                        }
                        out.push(ConnectionEvent::Stream(stream));
                    }
                }
                NegotiatorEvent::StreamRemoved(stream_id) => {
                    if let Self::Media(c) = self {
                        if c.remote_stream.as_ref().map(MediaStream::id)
                            == Some(stream_id.as_str())
                        {
                            c.remote_stream = None;
                        }
                        out.push(ConnectionEvent::StreamRemoved(stream_id));
                    }
                }
                NegotiatorEvent::SessionBroken => {
                    // The remote side discovers the break through its own
                    // transport monitoring; close without re-signaling.
                    out.extend(self.close(false).await);
                }
            }
        }
        out
    }

    /// Idempotent close. Only the first call emits `Closed`; `force_close`
    /// additionally yields the explicit remote-teardown signal.
    pub async fn close(&mut self, force_close: bool) -> Vec<ConnectionEvent> {
        if self.core().closed {
            return Vec::new();
        }
        {
            let core = self.core_mut();
            core.closed = true;
            core.open = false;
            core.queued.clear();
        }
        let negotiator = self.core_mut().negotiator.take();
        if let Some(mut negotiator) = negotiator {
            negotiator.cleanup().await;
        }
        let mut events = Vec::new();
        if force_close {
            events.push(ConnectionEvent::ForceClose);
        }
        events.push(ConnectionEvent::Closed);
        events
    }

    /// Queue an outbound payload (data connections only).
    pub fn send(&mut self, payload: DataPayload) -> Vec<ConnectionEvent> {
        match self {
            Self::Data(c) => c.send(payload),
            Self::Media(_) => vec![ConnectionEvent::Error(Error::validation(
                "send is only supported on data connections",
            ))],
        }
    }

    /// Push queued chunks into the engine, one per cooperative tick.
    pub async fn drain_send_queue(&mut self) -> Vec<ConnectionEvent> {
        match self {
            Self::Data(_) => self.drain_data().await,
            Self::Media(_) => Vec::new(),
        }
    }

    async fn drain_data(&mut self) -> Vec<ConnectionEvent> {
        use crate::engine::EngineError;
        let mut out = Vec::new();
        loop {
            let Some(chunk) = (match self {
                Self::Data(c) => c.pop_chunk(),
                Self::Media(_) => None,
            }) else {
                break;
            };
            let Some(negotiator) = self.core_mut().negotiator.as_mut() else {
                // Not ready yet; put it back and wait for the channel.
                if let Self::Data(c) = self {
                    c.requeue_front(chunk);
                }
                break;
            };
            match negotiator.send_data(chunk.clone()).await {
                Ok(()) => {
                    tokio::task::yield_now().await;
                }
                Err(EngineError::ChannelBusy) => {
                    // Backpressure: put the chunk back and hand control to
                    // the caller rather than blocking its loop here.
                    if let Self::Data(c) = self {
                        c.requeue_front(chunk);
                    }
                    out.push(ConnectionEvent::RetryDrain);
                    break;
                }
                Err(EngineError::ChannelClosed) => {
                    if let Self::Data(c) = self {
                        c.requeue_front(chunk);
                    }
                    break;
                }
                Err(e) => {
                    out.push(ConnectionEvent::Error(Error::data(format!(
                        "dropping chunk after send failure: {e}"
                    ))));
                }
            }
        }
        out
    }
}

/// Build the outbound signaling message for a connection event, if the
/// event is one that crosses the relay. The first offer of a data
/// connection carries its label/serialization/metadata so the remote side
/// can mirror it.
pub fn signal_message(
    connection: &Connection,
    local_id: &PeerId,
    room_name: Option<&RoomName>,
    event: &ConnectionEvent,
) -> Option<ClientMessage> {
    fn envelope_of<T>(
        connection: &Connection,
        local_id: &PeerId,
        room_name: Option<&RoomName>,
        label: Option<String>,
        serialization: Option<Serialization>,
        metadata: Option<serde_json::Value>,
        payload: T,
    ) -> Envelope<T> {
        Envelope {
            src: local_id.clone(),
            dst: connection.remote_id().clone(),
            connection_id: connection.id().clone(),
            connection_type: connection.kind(),
            room_name: room_name.cloned(),
            label,
            serialization,
            metadata,
            payload,
        }
    }

    match event {
        ConnectionEvent::SignalOffer(offer) => {
            let (label, serialization, metadata) = match connection.as_data() {
                Some(data) => (
                    Some(data.label().to_string()),
                    Some(data.serialization()),
                    connection.metadata().cloned(),
                ),
                None => (None, None, connection.metadata().cloned()),
            };
            Some(ClientMessage::SendOffer(envelope_of(
                connection,
                local_id,
                room_name,
                label,
                serialization,
                metadata,
                offer.clone(),
            )))
        }
        ConnectionEvent::SignalAnswer(answer) => Some(ClientMessage::SendAnswer(envelope_of(
            connection,
            local_id,
            room_name,
            None,
            None,
            None,
            answer.clone(),
        ))),
        ConnectionEvent::SignalCandidate(candidate) => {
            Some(ClientMessage::SendCandidate(envelope_of(
                connection,
                local_id,
                room_name,
                None,
                None,
                None,
                candidate.clone(),
            )))
        }
        ConnectionEvent::ForceClose => Some(ClientMessage::SendForceClose {
            src: local_id.clone(),
            dst: connection.remote_id().clone(),
            connection_id: connection.id().clone(),
        }),
        _ => None,
    }
}
