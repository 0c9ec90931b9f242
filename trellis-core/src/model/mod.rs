mod connection;
mod packet;
mod peer;
mod room;
mod signaling;

pub use connection::{ConnectionId, ConnectionType, InvalidSerialization, Serialization};
pub use packet::{
    Chunk, DataPayload, PacketError, Reassembly, decode_chunk, encode_chunk, split_payload,
};
pub use peer::PeerId;
pub use room::{RoomMode, RoomName};
pub use signaling::{
    ClientMessage, Envelope, IceCandidateInit, IceServerConfig, SdpKind, ServerMessage,
    SessionDescription, TurnCredential,
};
