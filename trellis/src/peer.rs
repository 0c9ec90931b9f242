//! Top-level dispatcher: owns the signaling session, every direct
//! connection and every joined room, and routes relay and engine traffic
//! to them from a single control loop.

use crate::connection::{
    Connection, ConnectionEvent, DataConnection, DataConnectionOptions, MediaConnection,
    MediaConnectionOptions, signal_message,
};
use crate::engine::{
    EngineConfig, EngineContext, EngineEvent, EngineFactory, MediaStream,
};
use crate::error::{Error, ErrorKind};
use crate::negotiator::{Negotiator, NegotiatorConfig, Role};
use crate::room::{BROADCAST_INTERVAL, MeshRoom, Room, RoomEvent, SfuRoom};
use crate::signaling::SignalingTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_core::model::{
    ClientMessage, ConnectionId, ConnectionType, DataPayload, Envelope, IceCandidateInit,
    IceServerConfig, PeerId, RoomMode, RoomName, ServerMessage, SessionDescription,
};

/// Delay before retrying a drain the channel pushed back on.
const DRAIN_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default)]
pub struct PeerOptions {
    /// Requested identity; the relay assigns one when absent.
    pub id: Option<PeerId>,
    pub ice_servers: Vec<IceServerConfig>,
}

#[derive(Debug)]
pub enum PeerEvent {
    /// The relay accepted us; the peer is usable from here on.
    Open(PeerId),
    /// A remote peer initiated a connection to us. Media connections wait
    /// for an explicit `answer`; data connections are mirrored immediately.
    IncomingConnection {
        peer_id: PeerId,
        connection_id: ConnectionId,
        kind: ConnectionType,
        metadata: Option<serde_json::Value>,
    },
    ConnectionOpen { connection_id: ConnectionId },
    ConnectionClosed { connection_id: ConnectionId },
    Data { connection_id: ConnectionId, payload: DataPayload },
    Stream {
        connection_id: ConnectionId,
        peer_id: PeerId,
        stream: MediaStream,
    },
    RoomOpen(RoomName),
    RoomPeerJoined { room_name: RoomName, peer_id: PeerId },
    RoomPeerLeft { room_name: RoomName, peer_id: PeerId },
    RoomStream {
        room_name: RoomName,
        peer_id: PeerId,
        stream: MediaStream,
    },
    RoomData {
        room_name: RoomName,
        src: PeerId,
        data: serde_json::Value,
    },
    RoomConnectionData {
        room_name: RoomName,
        src: PeerId,
        payload: DataPayload,
    },
    RoomClosed(RoomName),
    /// The relay credential expires soon; the application should refresh it.
    AuthExpiresIn { seconds: u64 },
    /// The signaling session is gone; every connection and room was torn
    /// down.
    Disconnected,
    Error(Error),
}

pub struct Peer {
    id: Option<PeerId>,
    requested_id: Option<PeerId>,
    open: bool,
    signaling: Box<dyn SignalingTransport>,
    inbound: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    ctx: EngineContext,
    engine_rx: mpsc::UnboundedReceiver<(ConnectionId, EngineEvent)>,
    connections: HashMap<PeerId, Vec<Connection>>,
    rooms: HashMap<RoomName, Room>,
    /// Direct-connection candidates that arrived before their offer.
    pending_candidates: HashMap<ConnectionId, Vec<IceCandidateInit>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    broadcast_timers: HashMap<RoomName, JoinHandle<()>>,
    tick_tx: mpsc::UnboundedSender<RoomName>,
    tick_rx: mpsc::UnboundedReceiver<RoomName>,
    drain_tx: mpsc::UnboundedSender<ConnectionId>,
    drain_rx: mpsc::UnboundedReceiver<ConnectionId>,
}

impl Peer {
    pub fn new(
        signaling: Box<dyn SignalingTransport>,
        factory: Arc<dyn EngineFactory>,
        options: PeerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (drain_tx, drain_rx) = mpsc::unbounded_channel();
        let ctx = EngineContext {
            factory,
            config: EngineConfig { ice_servers: options.ice_servers },
            events: engine_tx,
        };
        let peer = Self {
            id: None,
            requested_id: options.id,
            open: false,
            signaling,
            inbound: None,
            ctx,
            engine_rx,
            connections: HashMap::new(),
            rooms: HashMap::new(),
            pending_candidates: HashMap::new(),
            events: event_tx,
            broadcast_timers: HashMap::new(),
            tick_tx,
            tick_rx,
            drain_tx,
            drain_rx,
        };
        (peer, event_rx)
    }

    pub fn id(&self) -> Option<&PeerId> {
        self.id.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.values().flatten().find(|c| c.id() == id)
    }

    pub fn connections_of(&self, peer: &PeerId) -> &[Connection] {
        self.connections.get(peer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Establish the signaling session. `run` must be driven afterwards
    /// for any traffic to flow.
    pub async fn start(&mut self) -> Result<(), Error> {
        let rx = self.signaling.reconnect().await?;
        self.inbound = Some(rx);
        Ok(())
    }

    /// Tear down the current signaling session and open a fresh one. The
    /// peer is not usable again until the relay re-confirms it.
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        self.open = false;
        let rx = self.signaling.reconnect().await?;
        self.inbound = Some(rx);
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.signaling.close().await;
        self.inbound = None;
        self.teardown().await;
    }

    /// Single control loop: relay traffic, engine callbacks and broadcast
    /// timer ticks all funnel through here, serialized over `&mut self`.
    pub async fn run(&mut self) {
        let Some(mut inbound) = self.inbound.take() else {
            warn!("run called without a signaling session");
            return;
        };
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.dispatch(message).await,
                    None => {
                        warn!("signaling session lost");
                        self.teardown().await;
                        return;
                    }
                },
                event = self.engine_rx.recv() => {
                    if let Some((id, event)) = event {
                        self.route_engine_event(&id, event).await;
                    }
                },
                tick = self.tick_rx.recv() => {
                    if let Some(room_name) = tick {
                        self.broadcast_tick(room_name).await;
                    }
                },
                drained = self.drain_rx.recv() => {
                    if let Some(connection_id) = drained {
                        self.drain_tick(connection_id).await;
                    }
                },
            }
        }
    }

    /// Start an outgoing media connection.
    pub async fn call(
        &mut self,
        remote: PeerId,
        stream: MediaStream,
        options: MediaConnectionOptions,
    ) -> Result<ConnectionId, Error> {
        self.require_open()?;
        let connection = Connection::Media(MediaConnection::new(
            remote,
            true,
            options,
            Some(stream.clone()),
        ));
        let config = NegotiatorConfig {
            kind: ConnectionType::Media,
            local_stream: Some(stream),
            ..NegotiatorConfig::default()
        };
        self.start_connection(connection, Role::Originator, config).await
    }

    /// Start an outgoing data connection.
    pub async fn connect(
        &mut self,
        remote: PeerId,
        options: DataConnectionOptions,
    ) -> Result<ConnectionId, Error> {
        self.require_open()?;
        let connection = Connection::Data(DataConnection::new(remote, true, options));
        let label = connection
            .as_data()
            .map(|d| d.label().to_string())
            .unwrap_or_default();
        let config = NegotiatorConfig {
            kind: ConnectionType::Data,
            label,
            ..NegotiatorConfig::default()
        };
        self.start_connection(connection, Role::Originator, config).await
    }

    /// Accept an incoming media connection with our stream. Answering the
    /// same connection twice is a validation error.
    pub async fn answer(
        &mut self,
        connection_id: &ConnectionId,
        stream: MediaStream,
    ) -> Result<(), Error> {
        self.require_open()?;
        let offer = {
            let Some(connection) = find_conn(&mut self.connections, connection_id) else {
                return Err(Error::validation("unknown connection"));
            };
            let Some(media) = connection.as_media_mut() else {
                return Err(Error::validation("answer is only supported on media connections"));
            };
            media.prepare_answer(stream.clone())?
        };
        let engine = self.ctx.create(connection_id.clone()).await?;
        let negotiator = Negotiator::new(Role::Answerer, engine);
        let config = NegotiatorConfig {
            kind: ConnectionType::Media,
            local_stream: Some(stream),
            remote_offer: Some(offer),
            ..NegotiatorConfig::default()
        };
        let events = {
            let Some(connection) = find_conn(&mut self.connections, connection_id) else {
                return Ok(());
            };
            connection.attach_negotiator(negotiator, config).await
        };
        self.process_connection_events(connection_id.clone(), events).await;
        Ok(())
    }

    /// Queue a payload on a data connection and drain it.
    pub async fn send(
        &mut self,
        connection_id: &ConnectionId,
        payload: DataPayload,
    ) -> Result<(), Error> {
        let events = {
            let Some(connection) = find_conn(&mut self.connections, connection_id) else {
                return Err(Error::validation("unknown connection"));
            };
            connection.send(payload)
        };
        self.process_connection_events(connection_id.clone(), events).await;
        Ok(())
    }

    /// Swap the outgoing stream on a direct media connection.
    pub async fn replace_connection_stream(
        &mut self,
        connection_id: &ConnectionId,
        stream: MediaStream,
    ) -> Result<(), Error> {
        let events = {
            let Some(connection) = find_conn(&mut self.connections, connection_id) else {
                return Err(Error::validation("unknown connection"));
            };
            connection.replace_stream(stream).await
        };
        self.process_connection_events(connection_id.clone(), events).await;
        Ok(())
    }

    /// Close a direct connection and tell the remote side to tear down its
    /// mirror.
    pub async fn close_connection(&mut self, connection_id: &ConnectionId) {
        let events = {
            let Some(connection) = find_conn(&mut self.connections, connection_id) else {
                return;
            };
            connection.close(true).await
        };
        self.process_connection_events(connection_id.clone(), events).await;
    }

    pub async fn join_room(
        &mut self,
        name: RoomName,
        mode: RoomMode,
        local_stream: Option<MediaStream>,
    ) -> Result<(), Error> {
        let local_id = self.require_open()?;
        if name.0.is_empty() {
            return Err(Error::validation("room name must not be empty"));
        }
        if self.rooms.contains_key(&name) {
            return Err(Error::new(ErrorKind::Room, "room already joined"));
        }
        let room = match mode {
            RoomMode::Mesh => Room::Mesh(MeshRoom::new(name.clone(), local_id, local_stream)),
            RoomMode::Sfu => Room::Sfu(SfuRoom::new(name.clone(), local_id, local_stream)),
        };
        self.rooms.insert(name.clone(), room);
        self.send_signal(ClientMessage::RoomJoin { room_name: name, room_type: mode })
            .await;
        Ok(())
    }

    pub async fn leave_room(&mut self, name: &RoomName) {
        let Some(mut room) = self.rooms.remove(name) else {
            return;
        };
        let events = room.close().await;
        self.process_room_events(name.clone(), events).await;
        if let Some(timer) = self.broadcast_timers.remove(name) {
            timer.abort();
        }
    }

    /// Share media with every member of a room.
    pub async fn call_room(&mut self, name: &RoomName, stream: MediaStream) -> Result<(), Error> {
        let events = {
            let Some(room) = self.rooms.get_mut(name) else {
                return Err(Error::new(ErrorKind::Room, "not in that room"));
            };
            room.call(stream).await
        };
        self.process_room_events(name.clone(), events).await;
        Ok(())
    }

    /// Open data connections to every member of a mesh room.
    pub async fn connect_room(&mut self, name: &RoomName) -> Result<(), Error> {
        let events = {
            let Some(room) = self.rooms.get_mut(name) else {
                return Err(Error::new(ErrorKind::Room, "not in that room"));
            };
            room.connect()
        };
        self.process_room_events(name.clone(), events).await;
        Ok(())
    }

    /// Relay-broadcast a payload to a room, subject to the rate limiter.
    pub async fn send_room_data(
        &mut self,
        name: &RoomName,
        data: serde_json::Value,
    ) -> Result<(), Error> {
        let events = {
            let Some(room) = self.rooms.get_mut(name) else {
                return Err(Error::new(ErrorKind::Room, "not in that room"));
            };
            room.send_data(data)?
        };
        self.process_room_events(name.clone(), events).await;
        Ok(())
    }

    pub async fn replace_room_stream(
        &mut self,
        name: &RoomName,
        stream: MediaStream,
    ) -> Result<(), Error> {
        let events = {
            let Some(room) = self.rooms.get_mut(name) else {
                return Err(Error::new(ErrorKind::Room, "not in that room"));
            };
            room.replace_stream(stream).await
        };
        self.process_room_events(name.clone(), events).await;
        Ok(())
    }

    /// Route one relay message to its owner.
    pub async fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Open { peer_id, turn_credential } => {
                if let Some(requested) = &self.requested_id
                    && *requested != peer_id
                {
                    debug!("relay assigned {peer_id} instead of requested {requested}");
                }
                if turn_credential.is_some() {
                    debug!("relay provided a TURN credential");
                }
                self.id = Some(peer_id.clone());
                self.open = true;
                let _ = self.events.send(PeerEvent::Open(peer_id));
            }
            ServerMessage::Error { kind, message } => {
                let _ = self.events.send(PeerEvent::Error(Error::new(
                    ErrorKind::Protocol,
                    format!("{kind}: {message}"),
                )));
            }
            ServerMessage::Offer(envelope) => match envelope.room_name.clone() {
                Some(name) => {
                    let events = {
                        let Some(room) = self.rooms.get_mut(&name) else {
                            warn!("offer for unknown room {name}, dropping");
                            return;
                        };
                        room.handle_offer(envelope, &self.ctx).await
                    };
                    self.process_room_events(name, events).await;
                }
                None => self.handle_direct_offer(envelope).await,
            },
            ServerMessage::Answer(envelope) => match envelope.room_name.clone() {
                Some(name) => {
                    let events = {
                        let Some(room) = self.rooms.get_mut(&name) else {
                            warn!("answer for unknown room {name}, dropping");
                            return;
                        };
                        room.handle_answer(envelope).await
                    };
                    self.process_room_events(name, events).await;
                }
                None => {
                    let id = envelope.connection_id.clone();
                    let events = {
                        let Some(connection) = find_conn(&mut self.connections, &id) else {
                            warn!("answer for unknown connection {id}, dropping");
                            return;
                        };
                        connection.handle_answer(envelope.payload).await
                    };
                    self.process_connection_events(id, events).await;
                }
            },
            ServerMessage::Candidate(envelope) => match envelope.room_name.clone() {
                Some(name) => {
                    let events = {
                        let Some(room) = self.rooms.get_mut(&name) else {
                            warn!("candidate for unknown room {name}, dropping");
                            return;
                        };
                        room.handle_candidate(envelope).await
                    };
                    self.process_room_events(name, events).await;
                }
                None => {
                    let id = envelope.connection_id.clone();
                    let events = match find_conn(&mut self.connections, &id) {
                        Some(connection) => connection.handle_candidate(envelope.payload).await,
                        None => {
                            // Order-independent: the offer may still be in
                            // flight.
                            self.pending_candidates
                                .entry(id.clone())
                                .or_default()
                                .push(envelope.payload);
                            return;
                        }
                    };
                    self.process_connection_events(id, events).await;
                }
            },
            ServerMessage::Leave { peer_id } => {
                if let Some(mut conns) = self.connections.remove(&peer_id) {
                    for conn in &mut conns {
                        self.pending_candidates.remove(conn.id());
                        for event in conn.close(false).await {
                            if matches!(event, ConnectionEvent::Closed) {
                                let _ = self.events.send(PeerEvent::ConnectionClosed {
                                    connection_id: conn.id().clone(),
                                });
                            }
                        }
                    }
                }
            }
            ServerMessage::ForceClose { connection_id, .. } => {
                let events = {
                    let Some(connection) = find_conn(&mut self.connections, &connection_id)
                    else {
                        return;
                    };
                    // The remote mirror is already gone; close quietly.
                    connection.close(false).await
                };
                self.process_connection_events(connection_id, events).await;
            }
            ServerMessage::RoomUserJoin { src, room_name } => {
                let events = {
                    let Some(room) = self.rooms.get_mut(&room_name) else {
                        warn!("join for unknown room {room_name}, dropping");
                        return;
                    };
                    room.handle_join(src)
                };
                self.process_room_events(room_name, events).await;
            }
            ServerMessage::RoomUserLeave { src, room_name } => {
                let events = {
                    let Some(room) = self.rooms.get_mut(&room_name) else {
                        warn!("leave for unknown room {room_name}, dropping");
                        return;
                    };
                    room.handle_leave(src).await
                };
                self.process_room_events(room_name, events).await;
            }
            ServerMessage::RoomData { src, room_name, data } => {
                let events = {
                    let Some(room) = self.rooms.get_mut(&room_name) else {
                        warn!("data for unknown room {room_name}, dropping");
                        return;
                    };
                    room.handle_data(src, data)
                };
                self.process_room_events(room_name, events).await;
            }
            ServerMessage::RoomUsers { room_name, user_list, kind } => {
                let events = {
                    let Some(room) = self.rooms.get_mut(&room_name) else {
                        warn!("user list for unknown room {room_name}, dropping");
                        return;
                    };
                    room.handle_users(user_list, kind, &self.ctx).await
                };
                self.process_room_events(room_name, events).await;
            }
            ServerMessage::SfuOffer { room_name, offer, msids } => {
                let events = {
                    let Some(room) = self.rooms.get_mut(&room_name) else {
                        warn!("relay offer for unknown room {room_name}, dropping");
                        return;
                    };
                    room.handle_sfu_offer(offer, msids, &self.ctx).await
                };
                self.process_room_events(room_name, events).await;
            }
            ServerMessage::AuthExpiresIn { seconds } => {
                info!("signaling credential expires in {seconds}s");
                let _ = self.events.send(PeerEvent::AuthExpiresIn { seconds });
            }
        }
    }

    async fn handle_direct_offer(&mut self, envelope: Envelope<SessionDescription>) {
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

        if find_conn(&mut self.connections, &connection_id).is_some() {
            let events = {
                let Some(connection) = find_conn(&mut self.connections, &connection_id) else {
                    return;
                };
                connection.update_offer(offer).await
            };
            self.process_connection_events(connection_id, events).await;
            return;
        }

        match connection_type {
            ConnectionType::Media => {
                // The application decides whether and with which stream to
                // answer; hold the offer until then.
                let mut connection = Connection::Media(MediaConnection::new(
                    src.clone(),
                    false,
                    MediaConnectionOptions {
                        connection_id: Some(connection_id.clone()),
                        metadata: metadata.clone(),
                    },
                    None,
                ));
                connection.stash_offer(offer);
                if let Some(parked) = self.pending_candidates.remove(&connection_id) {
                    for candidate in parked {
                        let _ = connection.handle_candidate(candidate).await;
                    }
                }
                self.connections.entry(src.clone()).or_default().push(connection);
                let _ = self.events.send(PeerEvent::IncomingConnection {
                    peer_id: src,
                    connection_id,
                    kind: ConnectionType::Media,
                    metadata,
                });
            }
            ConnectionType::Data => {
                let connection = Connection::Data(DataConnection::new(
                    src.clone(),
                    false,
                    DataConnectionOptions {
                        connection_id: Some(connection_id.clone()),
                        label,
                        serialization: serialization.unwrap_or_default(),
                        metadata: metadata.clone(),
                    },
                ));
                let config = NegotiatorConfig {
                    kind: ConnectionType::Data,
                    remote_offer: Some(offer),
                    label: connection
                        .as_data()
                        .map(|d| d.label().to_string())
                        .unwrap_or_default(),
                    ..NegotiatorConfig::default()
                };
                let _ = self.events.send(PeerEvent::IncomingConnection {
                    peer_id: src,
                    connection_id: connection_id.clone(),
                    kind: ConnectionType::Data,
                    metadata,
                });
                if let Err(e) = self.start_connection(connection, Role::Answerer, config).await {
                    let _ = self.events.send(PeerEvent::Error(e));
                }
            }
        }
    }

    /// Create the engine session, attach a negotiator, replay parked
    /// candidates and register the connection.
    async fn start_connection(
        &mut self,
        mut connection: Connection,
        role: Role,
        config: NegotiatorConfig,
    ) -> Result<ConnectionId, Error> {
        let id = connection.id().clone();
        let engine = self.ctx.create(id.clone()).await?;
        let negotiator = Negotiator::new(role, engine);
        let mut events = connection.attach_negotiator(negotiator, config).await;
        if let Some(parked) = self.pending_candidates.remove(&id) {
            for candidate in parked {
                events.extend(connection.handle_candidate(candidate).await);
            }
        }
        let remote = connection.remote_id().clone();
        self.connections.entry(remote).or_default().push(connection);
        self.process_connection_events(id.clone(), events).await;
        Ok(id)
    }

    /// Feed one engine event to the connection or room that owns the
    /// session. `run` calls this; it is public for callers driving their
    /// own loop.
    pub async fn route_engine_event(&mut self, id: &ConnectionId, event: EngineEvent) {
        if find_conn(&mut self.connections, id).is_some() {
            let events = {
                let Some(connection) = find_conn(&mut self.connections, id) else {
                    return;
                };
                connection.handle_engine_event(event).await
            };
            self.process_connection_events(id.clone(), events).await;
            return;
        }
        let owner = self
            .rooms
            .iter()
            .find(|(_, room)| room.owns_connection(id))
            .map(|(name, _)| name.clone());
        let Some(name) = owner else {
            debug!("engine event for unknown connection {id}, dropping");
            return;
        };
        let events = {
            let Some(room) = self.rooms.get_mut(&name) else {
                return;
            };
            room.handle_engine_event(id, event).await
        };
        self.process_room_events(name, events).await;
    }

    async fn process_connection_events(
        &mut self,
        connection_id: ConnectionId,
        mut events: Vec<ConnectionEvent>,
    ) {
        loop {
            let mut outbound = Vec::new();
            let mut emits = Vec::new();
            let mut drain = false;
            let mut retry = false;
            let mut remove = false;
            {
                let local_id = self.id.clone().unwrap_or_else(|| PeerId::from(""));
                let Some(connection) = find_conn(&mut self.connections, &connection_id) else {
                    return;
                };
                for event in events {
                    if let Some(msg) = signal_message(connection, &local_id, None, &event) {
                        outbound.push(msg);
                    }
                    match event {
                        ConnectionEvent::Open => emits.push(PeerEvent::ConnectionOpen {
                            connection_id: connection_id.clone(),
                        }),
                        ConnectionEvent::Data(payload) => emits.push(PeerEvent::Data {
                            connection_id: connection_id.clone(),
                            payload,
                        }),
                        ConnectionEvent::Stream(stream) => emits.push(PeerEvent::Stream {
                            connection_id: connection_id.clone(),
                            peer_id: connection.remote_id().clone(),
                            stream,
                        }),
                        ConnectionEvent::Closed => {
                            emits.push(PeerEvent::ConnectionClosed {
                                connection_id: connection_id.clone(),
                            });
                            remove = true;
                        }
                        ConnectionEvent::DrainRequested => drain = true,
                        ConnectionEvent::RetryDrain => retry = true,
                        ConnectionEvent::Error(e) => emits.push(PeerEvent::Error(e)),
                        _ => {}
                    }
                }
            }
            for msg in outbound {
                self.send_signal(msg).await;
            }
            for event in emits {
                let _ = self.events.send(event);
            }
            if retry {
                self.schedule_drain(connection_id.clone());
            }
            if remove {
                remove_conn(&mut self.connections, &connection_id);
                self.pending_candidates.remove(&connection_id);
                return;
            }
            if !drain {
                return;
            }
            let Some(connection) = find_conn(&mut self.connections, &connection_id) else {
                return;
            };
            events = connection.drain_send_queue().await;
        }
    }

    async fn process_room_events(&mut self, name: RoomName, mut events: Vec<RoomEvent>) {
        loop {
            let mut outbound = Vec::new();
            let mut emits = Vec::new();
            let mut drains = Vec::new();
            let mut retries = Vec::new();
            let mut start_timer = false;
            let mut closed = false;
            for event in events {
                match event {
                    RoomEvent::Signal(msg) => outbound.push(msg),
                    RoomEvent::Open => emits.push(PeerEvent::RoomOpen(name.clone())),
                    RoomEvent::PeerJoined(peer_id) => emits.push(PeerEvent::RoomPeerJoined {
                        room_name: name.clone(),
                        peer_id,
                    }),
                    RoomEvent::PeerLeft(peer_id) => emits.push(PeerEvent::RoomPeerLeft {
                        room_name: name.clone(),
                        peer_id,
                    }),
                    RoomEvent::Stream { peer_id, stream } => emits.push(PeerEvent::RoomStream {
                        room_name: name.clone(),
                        peer_id,
                        stream,
                    }),
                    RoomEvent::Data { src, data } => emits.push(PeerEvent::RoomData {
                        room_name: name.clone(),
                        src,
                        data,
                    }),
                    RoomEvent::ConnectionData { src, payload } => {
                        emits.push(PeerEvent::RoomConnectionData {
                            room_name: name.clone(),
                            src,
                            payload,
                        });
                    }
                    RoomEvent::DrainRequested(id) => drains.push(id),
                    RoomEvent::RetryDrain(id) => retries.push(id),
                    RoomEvent::StartBroadcastTimer => start_timer = true,
                    RoomEvent::Closed => {
                        emits.push(PeerEvent::RoomClosed(name.clone()));
                        closed = true;
                    }
                    RoomEvent::Error(e) => emits.push(PeerEvent::Error(e)),
                }
            }
            for msg in outbound {
                self.send_signal(msg).await;
            }
            for event in emits {
                let _ = self.events.send(event);
            }
            for id in retries {
                self.schedule_drain(id);
            }
            if start_timer {
                self.start_broadcast_timer(name.clone());
            }
            if closed {
                self.rooms.remove(&name);
                if let Some(timer) = self.broadcast_timers.remove(&name) {
                    timer.abort();
                }
                return;
            }
            if drains.is_empty() {
                return;
            }
            let Some(room) = self.rooms.get_mut(&name) else {
                return;
            };
            let mut next = Vec::new();
            for id in drains {
                next.extend(room.drain_connection(&id).await);
            }
            events = next;
        }
    }

    fn schedule_drain(&self, connection_id: ConnectionId) {
        let tx = self.drain_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DRAIN_RETRY_DELAY).await;
            let _ = tx.send(connection_id);
        });
    }

    /// Retry a drain the channel pushed back on. Like `route_engine_event`,
    /// it is public for callers driving their own loop.
    pub async fn drain_tick(&mut self, connection_id: ConnectionId) {
        if find_conn(&mut self.connections, &connection_id).is_some() {
            let events = {
                let Some(connection) = find_conn(&mut self.connections, &connection_id) else {
                    return;
                };
                connection.drain_send_queue().await
            };
            self.process_connection_events(connection_id, events).await;
            return;
        }
        let owner = self
            .rooms
            .iter()
            .find(|(_, room)| room.owns_connection(&connection_id))
            .map(|(name, _)| name.clone());
        let Some(name) = owner else {
            return;
        };
        let events = {
            let Some(room) = self.rooms.get_mut(&name) else {
                return;
            };
            room.drain_connection(&connection_id).await
        };
        self.process_room_events(name, events).await;
    }

    fn start_broadcast_timer(&mut self, name: RoomName) {
        if self.broadcast_timers.contains_key(&name) {
            return;
        }
        let tx = self.tick_tx.clone();
        let tick_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(BROADCAST_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(tick_name.clone()).is_err() {
                    break;
                }
            }
        });
        self.broadcast_timers.insert(name, handle);
    }

    async fn broadcast_tick(&mut self, name: RoomName) {
        let Some(room) = self.rooms.get_mut(&name) else {
            if let Some(timer) = self.broadcast_timers.remove(&name) {
                timer.abort();
            }
            return;
        };
        let (message, done) = room.drain_broadcast();
        if let Some(message) = message {
            self.send_signal(message).await;
        }
        if done && let Some(timer) = self.broadcast_timers.remove(&name) {
            timer.abort();
        }
    }

    async fn send_signal(&mut self, message: ClientMessage) {
        if let Err(e) = self.signaling.send(message).await {
            warn!("failed to send signaling message: {e}");
            let _ = self.events.send(PeerEvent::Error(e.into()));
        }
    }

    fn require_open(&self) -> Result<PeerId, Error> {
        match (&self.id, self.open) {
            (Some(id), true) => Ok(id.clone()),
            _ => {
                let e = Error::disconnected("peer is not connected to the signaling relay");
                let _ = self.events.send(PeerEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    /// Release every session after the signaling relationship ends.
    async fn teardown(&mut self) {
        self.open = false;
        for (_, mut conns) in std::mem::take(&mut self.connections) {
            for conn in &mut conns {
                for event in conn.close(false).await {
                    if matches!(event, ConnectionEvent::Closed) {
                        let _ = self.events.send(PeerEvent::ConnectionClosed {
                            connection_id: conn.id().clone(),
                        });
                    }
                }
            }
        }
        for (name, mut room) in std::mem::take(&mut self.rooms) {
            let _ = room.close().await;
            let _ = self.events.send(PeerEvent::RoomClosed(name));
        }
        for (_, timer) in std::mem::take(&mut self.broadcast_timers) {
            timer.abort();
        }
        self.pending_candidates.clear();
        let _ = self.events.send(PeerEvent::Disconnected);
    }
}

fn find_conn<'a>(
    connections: &'a mut HashMap<PeerId, Vec<Connection>>,
    id: &ConnectionId,
) -> Option<&'a mut Connection> {
    connections.values_mut().flatten().find(|c| c.id() == id)
}

fn remove_conn(connections: &mut HashMap<PeerId, Vec<Connection>>, id: &ConnectionId) {
    for conns in connections.values_mut() {
        conns.retain(|c| c.id() != id);
    }
    connections.retain(|_, conns| !conns.is_empty());
}
