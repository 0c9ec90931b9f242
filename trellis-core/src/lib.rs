pub mod model;

pub use model::{
    ConnectionId, ConnectionType, IceCandidateInit, IceServerConfig, PeerId, RoomMode, RoomName,
    SdpKind, Serialization, SessionDescription,
};
pub use model::{ClientMessage, Envelope, ServerMessage};
pub use model::{
    Chunk, DataPayload, PacketError, Reassembly, decode_chunk, encode_chunk, split_payload,
};
