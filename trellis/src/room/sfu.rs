//! Forwarding-relay room: every member keeps a single upstream session
//! with the relay, which mixes all forwarded tracks into one offer. Track
//! ownership arrives out of band as an msid map, so streams can show up
//! before anyone knows whose they are.

use super::{RoomCore, RoomEvent};
use crate::engine::{EngineContext, EngineEvent, MediaStream};
use crate::negotiator::{Negotiator, NegotiatorConfig, NegotiatorEvent, Role};
use std::collections::HashMap;
use tracing::{debug, warn};
use trellis_core::model::{
    ClientMessage, ConnectionId, ConnectionType, PeerId, RoomName, SessionDescription,
};

pub struct SfuRoom {
    pub(crate) core: RoomCore,
    local_id: PeerId,
    pub(crate) open: bool,
    closed: bool,
    /// Engine-event routing id for the single upstream session.
    pub(crate) upstream_id: ConnectionId,
    negotiator: Option<Negotiator>,
    members: Vec<PeerId>,
    /// Stream id to owning peer. Entries are only added (or replaced by a
    /// newer relay snapshot) until the owner leaves.
    msid_to_peer: HashMap<String, PeerId>,
    /// Streams that arrived before their msid mapping; promoted on the
    /// next map update.
    unknown_streams: HashMap<String, MediaStream>,
    /// Already-surfaced remote streams, so a twice-reported track is
    /// emitted once.
    remote_streams: HashMap<String, MediaStream>,
}

impl SfuRoom {
    pub fn new(name: RoomName, local_id: PeerId, local_stream: Option<MediaStream>) -> Self {
        Self {
            core: RoomCore::new(name, local_stream),
            local_id,
            open: false,
            closed: false,
            upstream_id: ConnectionId::generate(ConnectionType::Media),
            negotiator: None,
            members: Vec::new(),
            msid_to_peer: HashMap::new(),
            unknown_streams: HashMap::new(),
            remote_streams: HashMap::new(),
        }
    }

    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    pub fn handle_join(&mut self, src: PeerId) -> Vec<RoomEvent> {
        if src == self.local_id {
            if self.open {
                return Vec::new();
            }
            self.open = true;
            return vec![
                RoomEvent::Open,
                RoomEvent::Signal(ClientMessage::SfuGetOffer {
                    room_name: self.core.name.clone(),
                }),
            ];
        }
        if self.members.contains(&src) {
            return Vec::new();
        }
        self.members.push(src.clone());
        vec![RoomEvent::PeerJoined(src)]
    }

    /// A relay offer describes the full forwarded session. The first one
    /// creates the upstream session; later ones renegotiate it.
    pub async fn handle_offer(
        &mut self,
        offer: SessionDescription,
        msids: HashMap<String, PeerId>,
        ctx: &EngineContext,
    ) -> Vec<RoomEvent> {
        let mut out = self.update_msid_map(msids);

        if self.negotiator.is_none() {
            let engine = match ctx.create(self.upstream_id.clone()).await {
                Ok(engine) => engine,
                Err(e) => {
                    out.push(RoomEvent::Error(e.into()));
                    return out;
                }
            };
            let mut negotiator = Negotiator::new(Role::Answerer, engine);
            let config = NegotiatorConfig {
                kind: ConnectionType::Media,
                local_stream: self.core.local_stream.clone(),
                remote_offer: Some(offer),
                ..NegotiatorConfig::default()
            };
            let result = negotiator.start(config).await;
            self.negotiator = Some(negotiator);
            out.extend(self.lift(result).await);
            return out;
        }

        let Some(negotiator) = self.negotiator.as_mut() else {
            return out;
        };
        let result = negotiator.handle_offer(offer).await;
        out.extend(self.lift(result).await);
        out
    }

    pub async fn handle_candidate(
        &mut self,
        candidate: trellis_core::model::IceCandidateInit,
    ) -> Vec<RoomEvent> {
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.handle_candidate(candidate).await;
        } else {
            debug!("relay candidate before upstream session, dropping");
        }
        Vec::new()
    }

    /// Merge a relay msid snapshot and promote any streams that were
    /// parked waiting for their owner. Promotion emits each stream exactly
    /// once; our own loopback tracks are swallowed.
    pub fn update_msid_map(&mut self, msids: HashMap<String, PeerId>) -> Vec<RoomEvent> {
        self.msid_to_peer.extend(msids);

        let resolvable: Vec<String> = self
            .unknown_streams
            .keys()
            .filter(|id| self.msid_to_peer.contains_key(*id))
            .cloned()
            .collect();
        let mut out = Vec::new();
        for id in resolvable {
            let Some(stream) = self.unknown_streams.remove(&id) else { continue };
            out.extend(self.surface_stream(stream));
        }
        out
    }

    fn surface_stream(&mut self, stream: MediaStream) -> Vec<RoomEvent> {
        let id = stream.id().to_string();
        match self.msid_to_peer.get(&id) {
            Some(owner) if *owner == self.local_id => Vec::new(),
            Some(owner) => {
                if self.remote_streams.contains_key(&id) {
                    debug!("stream {id} already surfaced, suppressing");
                    return Vec::new();
                }
                let owner = owner.clone();
                self.remote_streams.insert(id, stream.clone());
                vec![RoomEvent::Stream { peer_id: owner, stream }]
            }
            None => {
                debug!("stream {id} has no known owner yet, parking");
                self.unknown_streams.insert(id, stream);
                Vec::new()
            }
        }
    }

    pub fn handle_leave(&mut self, src: PeerId) -> Vec<RoomEvent> {
        let known = self.members.iter().any(|m| *m == src);
        self.members.retain(|m| *m != src);

        let owned: Vec<String> = self
            .msid_to_peer
            .iter()
            .filter(|(_, owner)| **owner == src)
            .map(|(id, _)| id.clone())
            .collect();
        for id in owned {
            self.msid_to_peer.remove(&id);
            self.remote_streams.remove(&id);
            self.unknown_streams.remove(&id);
        }

        if known {
            vec![RoomEvent::PeerLeft(src)]
        } else {
            Vec::new()
        }
    }

    pub async fn handle_engine_event(
        &mut self,
        id: &ConnectionId,
        event: EngineEvent,
    ) -> Vec<RoomEvent> {
        if *id != self.upstream_id {
            return Vec::new();
        }
        let Some(negotiator) = self.negotiator.as_mut() else {
            debug!("engine event before upstream session, dropping");
            return Vec::new();
        };
        let result = negotiator.handle_engine_event(event).await;
        self.lift(result).await
    }

    pub async fn replace_stream(&mut self, stream: MediaStream) -> Vec<RoomEvent> {
        let old = self.core.local_stream.clone();
        self.core.local_stream = Some(stream.clone());
        let Some(negotiator) = self.negotiator.as_mut() else {
            return Vec::new();
        };
        let result = negotiator.replace_stream(old.as_ref(), &stream).await;
        self.lift(result).await
    }

    pub async fn close(&mut self) -> Vec<RoomEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.open = false;
        if let Some(mut negotiator) = self.negotiator.take() {
            negotiator.cleanup().await;
        }
        self.unknown_streams.clear();
        self.remote_streams.clear();
        self.msid_to_peer.clear();
        vec![
            RoomEvent::Signal(ClientMessage::RoomLeave { room_name: self.core.name.clone() }),
            RoomEvent::Closed,
        ]
    }

    async fn lift(
        &mut self,
        result: Result<Vec<NegotiatorEvent>, crate::error::Error>,
    ) -> Vec<RoomEvent> {
        let events = match result {
            Ok(events) => events,
            Err(e) => return vec![RoomEvent::Error(e)],
        };
        let mut out = Vec::new();
        for event in events {
            match event {
                NegotiatorEvent::AnswerReady(sdp) => {
                    out.push(RoomEvent::Signal(ClientMessage::SfuAnswer {
                        room_name: self.core.name.clone(),
                        sdp,
                    }));
                }
                NegotiatorEvent::CandidateReady(candidate) => {
                    out.push(RoomEvent::Signal(ClientMessage::SfuCandidate {
                        room_name: self.core.name.clone(),
                        candidate,
                    }));
                }
                NegotiatorEvent::StreamAdded(stream) => {
                    out.extend(self.surface_stream(stream));
                }
                NegotiatorEvent::StreamRemoved(id) => {
                    self.remote_streams.remove(&id);
                    self.unknown_streams.remove(&id);
                }
                NegotiatorEvent::SessionBroken => {
                    warn!("upstream relay session broke, closing room");
                    out.extend(self.close().await);
                }
                NegotiatorEvent::OfferReady(_) => {
                    // The relay always originates; an outbound offer here
                    // means a stream swap fell back to renegotiation, which
                    // the relay protocol drives through a fresh SFU offer.
                    debug!("suppressing client-side offer on relay session");
                }
                NegotiatorEvent::ChannelOpen | NegotiatorEvent::DataReceived(_) => {}
            }
        }
        out
    }
}
