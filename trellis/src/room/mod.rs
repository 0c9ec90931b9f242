//! Multi-party rooms: full-mesh fan-out or a single selective-forwarding
//! relay session. Shared here: the rate-limited broadcast queue and the
//! payload size ceiling.

use crate::engine::{EngineContext, EngineEvent, MediaStream};
use crate::error::Error;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use trellis_core::model::{
    ClientMessage, ConnectionId, ConnectionType, DataPayload, Envelope, IceCandidateInit, PeerId,
    RoomMode, RoomName, SessionDescription,
};

mod mesh;
mod sfu;

pub use mesh::MeshRoom;
pub use sfu::SfuRoom;

/// Minimum spacing between outbound room broadcasts, regardless of how
/// fast the application calls `send_data`.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling on one encoded broadcast payload. Oversized payloads are
/// rejected, never truncated.
pub const MAX_BROADCAST_BYTES: usize = 1 << 20;

#[derive(Debug)]
pub enum RoomEvent {
    /// The relay acknowledged our own join.
    Open,
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Stream { peer_id: PeerId, stream: MediaStream },
    /// Relay-broadcast application data.
    Data { src: PeerId, data: serde_json::Value },
    /// Payload received over a direct in-room data connection.
    ConnectionData { src: PeerId, payload: DataPayload },
    /// Outbound signaling for the control loop to send.
    Signal(ClientMessage),
    /// A connection send queue wants draining; route back by id.
    DrainRequested(ConnectionId),
    /// The channel pushed back mid-drain; retry after a short delay.
    RetryDrain(ConnectionId),
    StartBroadcastTimer,
    Closed,
    Error(Error),
}

/// State shared by both room kinds.
pub struct RoomCore {
    pub(crate) name: RoomName,
    pub(crate) local_stream: Option<MediaStream>,
    queue: VecDeque<ClientMessage>,
    last_sent: Option<Instant>,
    timer_running: bool,
}

impl RoomCore {
    fn new(name: RoomName, local_stream: Option<MediaStream>) -> Self {
        Self {
            name,
            local_stream,
            queue: VecDeque::new(),
            last_sent: None,
            timer_running: false,
        }
    }

    /// Rate-limited broadcast: emit immediately when outside the minimum
    /// interval with no backlog, otherwise queue for the drain timer.
    fn send_data(&mut self, data: serde_json::Value) -> Result<Vec<RoomEvent>, Error> {
        let encoded = serde_json::to_vec(&data)
            .map_err(|e| Error::validation(format!("unencodable payload: {e}")))?;
        if encoded.len() > MAX_BROADCAST_BYTES {
            return Err(Error::validation(format!(
                "payload of {} bytes exceeds the {MAX_BROADCAST_BYTES}-byte ceiling",
                encoded.len()
            )));
        }

        let message = ClientMessage::RoomSendData { room_name: self.name.clone(), data };
        let now = Instant::now();
        let idle = self
            .last_sent
            .is_none_or(|last| now.duration_since(last) >= BROADCAST_INTERVAL);

        if idle && self.queue.is_empty() && !self.timer_running {
            self.last_sent = Some(now);
            return Ok(vec![RoomEvent::Signal(message)]);
        }

        self.queue.push_back(message);
        if !self.timer_running {
            self.timer_running = true;
            return Ok(vec![RoomEvent::StartBroadcastTimer]);
        }
        Ok(Vec::new())
    }

    /// One timer tick: release the oldest queued message. Returns the
    /// message (if any) and whether the timer should stop.
    fn drain_broadcast(&mut self) -> (Option<ClientMessage>, bool) {
        let message = self.queue.pop_front();
        if message.is_some() {
            self.last_sent = Some(Instant::now());
        }
        let done = self.queue.is_empty();
        if done {
            self.timer_running = false;
        }
        (message, done)
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        self.queue.len()
    }
}

/// Closed set of room kinds behind one interface.
pub enum Room {
    Mesh(MeshRoom),
    Sfu(SfuRoom),
}

impl Room {
    pub fn name(&self) -> &RoomName {
        match self {
            Self::Mesh(r) => &r.core.name,
            Self::Sfu(r) => &r.core.name,
        }
    }

    pub fn mode(&self) -> RoomMode {
        match self {
            Self::Mesh(_) => RoomMode::Mesh,
            Self::Sfu(_) => RoomMode::Sfu,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Self::Mesh(r) => r.open,
            Self::Sfu(r) => r.open,
        }
    }

    pub fn send_data(&mut self, data: serde_json::Value) -> Result<Vec<RoomEvent>, Error> {
        match self {
            Self::Mesh(r) => r.core.send_data(data),
            Self::Sfu(r) => r.core.send_data(data),
        }
    }

    pub fn drain_broadcast(&mut self) -> (Option<ClientMessage>, bool) {
        match self {
            Self::Mesh(r) => r.core.drain_broadcast(),
            Self::Sfu(r) => r.core.drain_broadcast(),
        }
    }

    pub fn handle_join(&mut self, src: PeerId) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.handle_join(src),
            Self::Sfu(r) => r.handle_join(src),
        }
    }

    pub async fn handle_leave(&mut self, src: PeerId) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.handle_leave(src).await,
            Self::Sfu(r) => r.handle_leave(src),
        }
    }

    pub fn handle_data(&mut self, src: PeerId, data: serde_json::Value) -> Vec<RoomEvent> {
        vec![RoomEvent::Data { src, data }]
    }

    pub async fn handle_users(
        &mut self,
        users: Vec<PeerId>,
        kind: ConnectionType,
        ctx: &EngineContext,
    ) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.handle_users(users, kind, ctx).await,
            Self::Sfu(_) => Vec::new(),
        }
    }

    pub async fn handle_offer(
        &mut self,
        envelope: Envelope<SessionDescription>,
        ctx: &EngineContext,
    ) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.handle_offer(envelope, ctx).await,
            Self::Sfu(_) => {
                tracing::warn!("peer-addressed offer routed to an SFU room, dropping");
                Vec::new()
            }
        }
    }

    pub async fn handle_answer(
        &mut self,
        envelope: Envelope<SessionDescription>,
    ) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.handle_answer(envelope).await,
            Self::Sfu(_) => Vec::new(),
        }
    }

    pub async fn handle_candidate(
        &mut self,
        envelope: Envelope<IceCandidateInit>,
    ) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.handle_candidate(envelope).await,
            Self::Sfu(r) => r.handle_candidate(envelope.payload).await,
        }
    }

    pub async fn handle_sfu_offer(
        &mut self,
        offer: SessionDescription,
        msids: std::collections::HashMap<String, PeerId>,
        ctx: &EngineContext,
    ) -> Vec<RoomEvent> {
        match self {
            Self::Sfu(r) => r.handle_offer(offer, msids, ctx).await,
            Self::Mesh(_) => {
                tracing::warn!("SFU offer routed to a mesh room, dropping");
                Vec::new()
            }
        }
    }

    pub fn owns_connection(&self, id: &ConnectionId) -> bool {
        match self {
            Self::Mesh(r) => r.owns_connection(id),
            Self::Sfu(r) => r.upstream_id == *id,
        }
    }

    pub async fn handle_engine_event(
        &mut self,
        id: &ConnectionId,
        event: EngineEvent,
    ) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.handle_engine_event(id, event).await,
            Self::Sfu(r) => r.handle_engine_event(id, event).await,
        }
    }

    pub async fn drain_connection(&mut self, id: &ConnectionId) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.drain_connection(id).await,
            Self::Sfu(_) => Vec::new(),
        }
    }

    pub async fn call(&mut self, stream: MediaStream) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.call(stream),
            Self::Sfu(r) => r.replace_stream(stream).await,
        }
    }

    pub fn connect(&mut self) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.connect(),
            Self::Sfu(_) => Vec::new(),
        }
    }

    pub async fn replace_stream(&mut self, stream: MediaStream) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.replace_stream(stream).await,
            Self::Sfu(r) => r.replace_stream(stream).await,
        }
    }

    pub async fn close(&mut self) -> Vec<RoomEvent> {
        match self {
            Self::Mesh(r) => r.close().await,
            Self::Sfu(r) => r.close().await,
        }
    }
}
