//! Full-mesh room: one direct connection per remote member and kind. The
//! relay only carries membership and signaling; payloads flow peer to peer.

use super::{RoomCore, RoomEvent};
use crate::connection::{
    Connection, ConnectionEvent, DataConnection, DataConnectionOptions, MediaConnection,
    MediaConnectionOptions, signal_message,
};
use crate::engine::{EngineContext, EngineEvent, MediaStream};
use crate::error::Error;
use crate::negotiator::{Negotiator, NegotiatorConfig, Role};
use std::collections::HashMap;
use tracing::{debug, warn};
use trellis_core::model::{
    ClientMessage, ConnectionId, ConnectionType, Envelope, IceCandidateInit, PeerId, RoomName,
    SessionDescription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberState {
    /// Announced by the relay, no session yet.
    Present,
    ConnectionRequested,
    Connected,
}

pub struct MeshRoom {
    pub(crate) core: RoomCore,
    local_id: PeerId,
    pub(crate) open: bool,
    closed: bool,
    members: HashMap<PeerId, MemberState>,
    connections: HashMap<PeerId, Vec<Connection>>,
    /// Candidates that arrived before their connection existed, keyed by
    /// the id they were addressed to.
    pending_candidates: HashMap<ConnectionId, Vec<IceCandidateInit>>,
    pending_call: bool,
    pending_connect: bool,
}

impl MeshRoom {
    pub fn new(name: RoomName, local_id: PeerId, local_stream: Option<MediaStream>) -> Self {
        Self {
            core: RoomCore::new(name, local_stream),
            local_id,
            open: false,
            closed: false,
            members: HashMap::new(),
            connections: HashMap::new(),
            pending_candidates: HashMap::new(),
            pending_call: false,
            pending_connect: false,
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &PeerId> {
        self.members.keys()
    }

    /// Share media with every current and future member. Before the relay
    /// confirms our join this only records intent.
    pub fn call(&mut self, stream: MediaStream) -> Vec<RoomEvent> {
        self.core.local_stream = Some(stream);
        if self.open {
            return vec![RoomEvent::Signal(self.get_users(ConnectionType::Media))];
        }
        self.pending_call = true;
        Vec::new()
    }

    /// Open data connections to every current member.
    pub fn connect(&mut self) -> Vec<RoomEvent> {
        if self.open {
            return vec![RoomEvent::Signal(self.get_users(ConnectionType::Data))];
        }
        self.pending_connect = true;
        Vec::new()
    }

    fn get_users(&self, kind: ConnectionType) -> ClientMessage {
        ClientMessage::RoomGetUsers { room_name: self.core.name.clone(), kind }
    }

    pub fn handle_join(&mut self, src: PeerId) -> Vec<RoomEvent> {
        if src == self.local_id {
            if self.open {
                return Vec::new();
            }
            self.open = true;
            let mut out = vec![RoomEvent::Open];
            if std::mem::take(&mut self.pending_call) {
                out.push(RoomEvent::Signal(self.get_users(ConnectionType::Media)));
            }
            if std::mem::take(&mut self.pending_connect) {
                out.push(RoomEvent::Signal(self.get_users(ConnectionType::Data)));
            }
            return out;
        }
        if self.members.contains_key(&src) {
            return Vec::new();
        }
        self.members.insert(src.clone(), MemberState::Present);
        vec![RoomEvent::PeerJoined(src)]
    }

    /// Fan out to the member list; idempotent over repeated responses.
    pub async fn handle_users(
        &mut self,
        users: Vec<PeerId>,
        kind: ConnectionType,
        ctx: &EngineContext,
    ) -> Vec<RoomEvent> {
        let mut out = Vec::new();
        for user in users {
            if user == self.local_id || self.has_connection_of_kind(&user, kind) {
                continue;
            }
            let connection = match kind {
                ConnectionType::Media => {
                    let Some(stream) = self.core.local_stream.clone() else {
                        out.push(RoomEvent::Error(Error::validation(
                            "cannot call without a local stream",
                        )));
                        break;
                    };
                    Connection::Media(MediaConnection::new(
                        user.clone(),
                        true,
                        MediaConnectionOptions::default(),
                        Some(stream),
                    ))
                }
                ConnectionType::Data => Connection::Data(DataConnection::new(
                    user.clone(),
                    true,
                    DataConnectionOptions::default(),
                )),
            };
            self.note_requested(&user);
            out.extend(
                self.open_connection(connection, self.originator_config(kind), ctx)
                    .await,
            );
        }
        out
    }

    fn originator_config(&self, kind: ConnectionType) -> NegotiatorConfig {
        NegotiatorConfig {
            kind,
            local_stream: match kind {
                ConnectionType::Media => self.core.local_stream.clone(),
                ConnectionType::Data => None,
            },
            ..NegotiatorConfig::default()
        }
    }

    /// An incoming offer either updates an existing session, loses or wins
    /// a crossing-offer tie-break, or starts a new answerer session.
    ///
    /// Tie-break for simultaneous offers on the same peer pair and kind:
    /// the offer originating from the lexicographically lower peer id
    /// survives; the other side discards its own attempt and answers.
    pub async fn handle_offer(
        &mut self,
        envelope: Envelope<SessionDescription>,
        ctx: &EngineContext,
    ) -> Vec<RoomEvent> {
        let Envelope {
            src,
            connection_id,
            connection_type,
            label,
            serialization,
            metadata,
            payload: offer,
            ..
        } = envelope;

        if self.connection_mut(&connection_id).is_some() {
            return self.update_existing(&connection_id, offer).await;
        }

        if let Some(conns) = self.connections.get_mut(&src)
            && let Some(pos) = conns
                .iter()
                .position(|c| c.kind() == connection_type && !c.is_closed())
        {
            if conns[pos].is_open() {
                // Renegotiation arriving under a fresh id: treat as a
                // session update on the established connection.
                let existing = conns[pos].id().clone();
                return self.update_existing(&existing, offer).await;
            }
            if conns[pos].is_originator() {
                if src < self.local_id {
                    debug!("crossing offer from {src} wins tie-break, discarding ours");
                    let mut ours = conns.remove(pos);
                    self.pending_candidates.remove(ours.id());
                    let _ = ours.close(false).await;
                } else {
                    debug!("crossing offer from {src} loses tie-break, ignoring");
                    return Vec::new();
                }
            }
        }

        let connection = match connection_type {
            ConnectionType::Data => Connection::Data(DataConnection::new(
                src.clone(),
                false,
                DataConnectionOptions {
                    connection_id: Some(connection_id),
                    label,
                    serialization: serialization.unwrap_or_default(),
                    metadata,
                },
            )),
            ConnectionType::Media => Connection::Media(MediaConnection::new(
                src.clone(),
                false,
                MediaConnectionOptions { connection_id: Some(connection_id), metadata },
                self.core.local_stream.clone(),
            )),
        };
        let config = NegotiatorConfig {
            kind: connection_type,
            local_stream: match connection_type {
                ConnectionType::Media => self.core.local_stream.clone(),
                ConnectionType::Data => None,
            },
            remote_offer: Some(offer),
            label: connection
                .as_data()
                .map(|d| d.label().to_string())
                .unwrap_or_default(),
            ..NegotiatorConfig::default()
        };
        self.note_requested(&src);
        self.open_connection(connection, config, ctx).await
    }

    async fn update_existing(
        &mut self,
        id: &ConnectionId,
        offer: SessionDescription,
    ) -> Vec<RoomEvent> {
        let local_id = self.local_id.clone();
        let name = self.core.name.clone();
        let Some(connection) = self.connection_mut(id) else {
            return Vec::new();
        };
        let events = connection.update_offer(offer).await;
        let peer = connection.remote_id().clone();
        let opened = opened_in(&events);
        let out = Self::lift(&local_id, &name, &peer, connection, events);
        if opened {
            self.members.insert(peer, MemberState::Connected);
        }
        out
    }

    pub async fn handle_answer(
        &mut self,
        envelope: Envelope<SessionDescription>,
    ) -> Vec<RoomEvent> {
        let local_id = self.local_id.clone();
        let name = self.core.name.clone();
        let Some(connection) = self.connection_mut(&envelope.connection_id) else {
            warn!("answer for unknown connection {}, dropping", envelope.connection_id);
            return Vec::new();
        };
        let events = connection.handle_answer(envelope.payload).await;
        let peer = connection.remote_id().clone();
        let opened = opened_in(&events);
        let out = Self::lift(&local_id, &name, &peer, connection, events);
        if opened {
            self.members.insert(peer, MemberState::Connected);
        }
        out
    }

    pub async fn handle_candidate(
        &mut self,
        envelope: Envelope<IceCandidateInit>,
    ) -> Vec<RoomEvent> {
        let local_id = self.local_id.clone();
        let name = self.core.name.clone();
        let Some(connection) = self.connection_mut(&envelope.connection_id) else {
            self.pending_candidates
                .entry(envelope.connection_id)
                .or_default()
                .push(envelope.payload);
            return Vec::new();
        };
        let events = connection.handle_candidate(envelope.payload).await;
        let peer = connection.remote_id().clone();
        Self::lift(&local_id, &name, &peer, connection, events)
    }

    pub async fn handle_leave(&mut self, src: PeerId) -> Vec<RoomEvent> {
        let mut known = self.members.remove(&src).is_some();
        if let Some(mut conns) = self.connections.remove(&src) {
            known = true;
            for conn in &mut conns {
                self.pending_candidates.remove(conn.id());
                // No signaling back: the member is already gone.
                let _ = conn.close(false).await;
            }
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
        let local_id = self.local_id.clone();
        let name = self.core.name.clone();
        let Some(connection) = self.connection_mut(id) else {
            debug!("engine event for unknown room connection {id}, dropping");
            return Vec::new();
        };
        let events = connection.handle_engine_event(event).await;
        let peer = connection.remote_id().clone();
        let opened = opened_in(&events);
        let out = Self::lift(&local_id, &name, &peer, connection, events);
        if opened {
            self.members.insert(peer, MemberState::Connected);
        }
        out
    }

    pub async fn drain_connection(&mut self, id: &ConnectionId) -> Vec<RoomEvent> {
        let local_id = self.local_id.clone();
        let name = self.core.name.clone();
        let Some(connection) = self.connection_mut(id) else {
            return Vec::new();
        };
        let events = connection.drain_send_queue().await;
        let peer = connection.remote_id().clone();
        Self::lift(&local_id, &name, &peer, connection, events)
    }

    /// Swap the shared stream on every media session in the room.
    pub async fn replace_stream(&mut self, stream: MediaStream) -> Vec<RoomEvent> {
        self.core.local_stream = Some(stream.clone());
        let local_id = self.local_id.clone();
        let name = self.core.name.clone();
        let mut out = Vec::new();
        for (peer, conns) in &mut self.connections {
            for conn in conns
                .iter_mut()
                .filter(|c| c.kind() == ConnectionType::Media && !c.is_closed())
            {
                let events = conn.replace_stream(stream.clone()).await;
                out.extend(Self::lift(&local_id, &name, peer, conn, events));
            }
        }
        out
    }

    /// Broadcast a payload over every open in-room data connection.
    pub fn send_to_connections(&mut self, payload: trellis_core::model::DataPayload) -> Vec<RoomEvent> {
        let local_id = self.local_id.clone();
        let name = self.core.name.clone();
        let mut out = Vec::new();
        for (peer, conns) in &mut self.connections {
            for conn in conns.iter_mut().filter(|c| c.kind() == ConnectionType::Data) {
                let events = conn.send(payload.clone());
                out.extend(Self::lift(&local_id, &name, peer, conn, events));
            }
        }
        out
    }

    pub async fn close(&mut self) -> Vec<RoomEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.open = false;
        for conns in self.connections.values_mut() {
            for conn in conns {
                let _ = conn.close(false).await;
            }
        }
        self.connections.clear();
        self.pending_candidates.clear();
        vec![
            RoomEvent::Signal(ClientMessage::RoomLeave { room_name: self.core.name.clone() }),
            RoomEvent::Closed,
        ]
    }

    pub fn owns_connection(&self, id: &ConnectionId) -> bool {
        self.connections.values().flatten().any(|c| c.id() == id)
    }

    fn has_connection_of_kind(&self, peer: &PeerId, kind: ConnectionType) -> bool {
        self.connections
            .get(peer)
            .is_some_and(|conns| conns.iter().any(|c| c.kind() == kind && !c.is_closed()))
    }

    fn connection_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.values_mut().flatten().find(|c| c.id() == id)
    }

    fn note_requested(&mut self, peer: &PeerId) {
        let state = self.members.entry(peer.clone()).or_insert(MemberState::Present);
        if *state != MemberState::Connected {
            *state = MemberState::ConnectionRequested;
        }
    }

    /// Create the engine session, attach a negotiator, replay any parked
    /// candidates and register the connection.
    async fn open_connection(
        &mut self,
        mut connection: Connection,
        config: NegotiatorConfig,
        ctx: &EngineContext,
    ) -> Vec<RoomEvent> {
        let role = if connection.is_originator() { Role::Originator } else { Role::Answerer };
        let mut config = config;
        if role == Role::Answerer && config.remote_offer.is_none() {
            config.remote_offer = connection.take_pending_offer();
        }
        let engine = match ctx.create(connection.id().clone()).await {
            Ok(engine) => engine,
            Err(e) => return vec![RoomEvent::Error(e.into())],
        };
        let negotiator = Negotiator::new(role, engine);
        let mut events = connection.attach_negotiator(negotiator, config).await;
        if let Some(parked) = self.pending_candidates.remove(connection.id()) {
            for candidate in parked {
                events.extend(connection.handle_candidate(candidate).await);
            }
        }
        let peer = connection.remote_id().clone();
        let opened = opened_in(&events);
        let out = Self::lift(&self.local_id, &self.core.name, &peer, &connection, events);
        self.connections.entry(peer.clone()).or_default().push(connection);
        if opened {
            self.members.insert(peer, MemberState::Connected);
        }
        out
    }

    fn lift(
        local_id: &PeerId,
        room_name: &RoomName,
        peer: &PeerId,
        connection: &Connection,
        events: Vec<ConnectionEvent>,
    ) -> Vec<RoomEvent> {
        let mut out = Vec::new();
        for event in events {
            if let Some(msg) = signal_message(connection, local_id, Some(room_name), &event) {
                out.push(RoomEvent::Signal(msg));
                continue;
            }
            match event {
                ConnectionEvent::Data(payload) => {
                    out.push(RoomEvent::ConnectionData { src: peer.clone(), payload });
                }
                ConnectionEvent::Stream(stream) => {
                    out.push(RoomEvent::Stream { peer_id: peer.clone(), stream });
                }
                ConnectionEvent::DrainRequested => {
                    out.push(RoomEvent::DrainRequested(connection.id().clone()));
                }
                ConnectionEvent::RetryDrain => {
                    out.push(RoomEvent::RetryDrain(connection.id().clone()));
                }
                ConnectionEvent::Error(e) => out.push(RoomEvent::Error(e)),
                _ => {}
            }
        }
        out
    }
}

fn opened_in(events: &[ConnectionEvent]) -> bool {
    events.iter().any(|e| matches!(e, ConnectionEvent::Open))
}
