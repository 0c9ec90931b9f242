//! Session-negotiation and room-orchestration client for a signaling
//! relay.
//!
//! A [`Peer`] holds one relay session and dispatches its traffic to
//! direct [`Connection`]s and to mesh or forwarding-relay rooms. The
//! transport engine behind each session sits behind the
//! [`engine::SessionEngine`] trait; [`engine::RtcEngine`] is the
//! production implementation.

pub mod connection;
pub mod engine;
pub mod error;
pub mod negotiator;
pub mod peer;
pub mod room;
pub mod signaling;

pub use connection::{
    Connection, ConnectionEvent, DataConnection, DataConnectionOptions, MediaConnection,
    MediaConnectionOptions,
};
pub use engine::{
    EngineConfig, EngineContext, EngineError, EngineEvent, EngineFactory, MediaStream, RtcEngine,
    RtcEngineFactory, SessionEngine,
};
pub use error::{Error, ErrorKind};
pub use negotiator::{NegotiationState, Negotiator, NegotiatorConfig, NegotiatorEvent, Role};
pub use peer::{Peer, PeerEvent, PeerOptions};
pub use room::{MeshRoom, Room, RoomEvent, SfuRoom};
pub use signaling::{SignalingError, SignalingTransport, WsSignaling};

pub use trellis_core::model;
