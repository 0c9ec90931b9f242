//! Boundary to the media/data transport engine. The orchestration layer
//! only sequences descriptions, candidates, streams and channel traffic;
//! everything behind this trait (codecs, ICE, DTLS, actual transport) is
//! the engine's business.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use trellis_core::model::{ConnectionId, IceCandidateInit, IceServerConfig, SessionDescription};
use uuid::Uuid;
use webrtc::track::track_local::TrackLocal;

mod rtc;

pub use rtc::{RtcEngine, RtcEngineFactory};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient rejection; the caller may retry the same payload.
    #[error("channel busy, retry later")]
    ChannelBusy,
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("engine failure: {0}")]
    Failed(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChannelBusy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OfferOptions {
    pub ice_restart: bool,
}

#[derive(Debug, Clone)]
pub struct DataChannelConfig {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self { ordered: true, max_retransmits: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub ice_servers: Vec<IceServerConfig>,
}

/// Cheap-clone handle to a set of media tracks sharing one stream id.
/// Remote streams carry no local tracks; they exist to correlate engine
/// track events with the peer that produced them.
#[derive(Clone, Default)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { id: Uuid::new_v4().to_string(), tracks }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into(), tracks: Vec::new() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Asynchronous engine output, tagged with the owning connection id on the
/// shared channel so the control loop can route it.
#[derive(Debug)]
pub enum EngineEvent {
    IceCandidate(IceCandidateInit),
    StreamAdded(MediaStream),
    StreamRemoved(String),
    DataChannelOpen,
    DataReceived(Bytes),
    NegotiationNeeded,
    /// Connection-state monitoring reported a broken session.
    Broken,
}

/// One transport-engine session. Implementations must tolerate `close`
/// being called more than once.
#[async_trait]
pub trait SessionEngine: Send {
    async fn create_offer(
        &mut self,
        options: &OfferOptions,
    ) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidateInit)
    -> Result<(), EngineError>;

    fn signaling_state(&self) -> SignalingState;

    async fn create_data_channel(
        &mut self,
        label: &str,
        config: &DataChannelConfig,
    ) -> Result<(), EngineError>;

    /// Push one message onto the data channel. `ChannelBusy` means the
    /// payload was not taken and may be retried as-is.
    async fn send_data(&mut self, data: Bytes) -> Result<(), EngineError>;

    async fn add_stream(&mut self, stream: &MediaStream) -> Result<(), EngineError>;

    async fn remove_stream(&mut self, stream: &MediaStream) -> Result<(), EngineError>;

    /// Swap outgoing tracks without renegotiation. Returns `false` when the
    /// engine cannot replace per-track and the caller must fall back to a
    /// remove/add plus renegotiation sequence.
    async fn replace_track(&mut self, stream: &MediaStream) -> Result<bool, EngineError>;

    /// Configure receive-only media intent (no local tracks attached).
    async fn receive_media(&mut self) -> Result<(), EngineError>;

    async fn close(&mut self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        id: ConnectionId,
        config: EngineConfig,
        events: mpsc::UnboundedSender<(ConnectionId, EngineEvent)>,
    ) -> Result<Box<dyn SessionEngine>, EngineError>;
}

/// Everything a connection or room needs to mint engine sessions: the
/// factory, the shared ICE/transport configuration, and the event channel
/// feeding the control loop.
#[derive(Clone)]
pub struct EngineContext {
    pub factory: Arc<dyn EngineFactory>,
    pub config: EngineConfig,
    pub events: mpsc::UnboundedSender<(ConnectionId, EngineEvent)>,
}

impl EngineContext {
    pub async fn create(&self, id: ConnectionId) -> Result<Box<dyn SessionEngine>, EngineError> {
        self.factory
            .create(id, self.config.clone(), self.events.clone())
            .await
    }
}
