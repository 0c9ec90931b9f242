use crate::model::connection::{ConnectionId, ConnectionType, Serialization};
use crate::model::peer::PeerId;
use crate::model::room::{RoomMode, RoomName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque SDP-like blob. Immutable once sent; renegotiation replaces it
/// wholesale. Byte equality on `sdp` is what offer de-duplication uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// Opaque connectivity hint. Order-independent; may arrive before or after
/// the description it relates to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Short-lived TURN credential handed out with OPEN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnCredential {
    pub username: String,
    pub credential: String,
}

/// Addressed signaling payload shared by offer/answer/candidate messages.
///
/// The data-connection attributes (`label`, `serialization`, `metadata`)
/// ride along on the first offer so the remote side can mirror the
/// connection before any negotiation completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    pub src: PeerId,
    pub dst: PeerId,
    pub connection_id: ConnectionId,
    pub connection_type: ConnectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<RoomName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<Serialization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub payload: T,
}

/// Messages delivered by the signaling relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "OPEN")]
    Open {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_credential: Option<TurnCredential>,
    },
    #[serde(rename = "ERROR")]
    Error { kind: String, message: String },
    #[serde(rename = "OFFER")]
    Offer(Envelope<SessionDescription>),
    #[serde(rename = "ANSWER")]
    Answer(Envelope<SessionDescription>),
    #[serde(rename = "CANDIDATE")]
    Candidate(Envelope<IceCandidateInit>),
    #[serde(rename = "LEAVE")]
    Leave { peer_id: PeerId },
    #[serde(rename = "FORCE_CLOSE")]
    ForceClose {
        src: PeerId,
        dst: PeerId,
        connection_id: ConnectionId,
    },
    #[serde(rename = "ROOM_USER_JOIN")]
    RoomUserJoin { src: PeerId, room_name: RoomName },
    #[serde(rename = "ROOM_USER_LEAVE")]
    RoomUserLeave { src: PeerId, room_name: RoomName },
    #[serde(rename = "ROOM_DATA")]
    RoomData {
        src: PeerId,
        room_name: RoomName,
        data: serde_json::Value,
    },
    #[serde(rename = "ROOM_USERS")]
    RoomUsers {
        room_name: RoomName,
        user_list: Vec<PeerId>,
        kind: ConnectionType,
    },
    #[serde(rename = "SFU_OFFER")]
    SfuOffer {
        room_name: RoomName,
        offer: SessionDescription,
        msids: HashMap<String, PeerId>,
    },
    #[serde(rename = "AUTH_EXPIRES_IN")]
    AuthExpiresIn { seconds: u64 },
}

/// Messages sent to the signaling relay. Keys mirror the inbound catalogue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "SEND_OFFER")]
    SendOffer(Envelope<SessionDescription>),
    #[serde(rename = "SEND_ANSWER")]
    SendAnswer(Envelope<SessionDescription>),
    #[serde(rename = "SEND_CANDIDATE")]
    SendCandidate(Envelope<IceCandidateInit>),
    #[serde(rename = "SEND_FORCE_CLOSE")]
    SendForceClose {
        src: PeerId,
        dst: PeerId,
        connection_id: ConnectionId,
    },
    #[serde(rename = "ROOM_JOIN")]
    RoomJoin { room_name: RoomName, room_type: RoomMode },
    #[serde(rename = "ROOM_LEAVE")]
    RoomLeave { room_name: RoomName },
    #[serde(rename = "ROOM_SEND_DATA")]
    RoomSendData {
        room_name: RoomName,
        data: serde_json::Value,
    },
    #[serde(rename = "ROOM_GET_USERS")]
    RoomGetUsers {
        room_name: RoomName,
        kind: ConnectionType,
    },
    #[serde(rename = "SFU_GET_OFFER")]
    SfuGetOffer { room_name: RoomName },
    #[serde(rename = "SFU_ANSWER")]
    SfuAnswer {
        room_name: RoomName,
        sdp: SessionDescription,
    },
    #[serde(rename = "SFU_CANDIDATE")]
    SfuCandidate {
        room_name: RoomName,
        candidate: IceCandidateInit,
    },
}
