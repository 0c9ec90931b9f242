use tokio::sync::mpsc;
use trellis::peer::PeerEvent;
use trellis_core::model::{
    ClientMessage, ConnectionId, ConnectionType, Envelope, PeerId, ServerMessage,
};

/// Forward an outbound client message the way the relay would deliver it
/// to the remote peer. Messages the relay consumes itself map to `None`.
pub fn relay(message: ClientMessage) -> Option<ServerMessage> {
    match message {
        ClientMessage::SendOffer(env) => Some(ServerMessage::Offer(env)),
        ClientMessage::SendAnswer(env) => Some(ServerMessage::Answer(env)),
        ClientMessage::SendCandidate(env) => Some(ServerMessage::Candidate(env)),
        ClientMessage::SendForceClose { src, dst, connection_id } => {
            Some(ServerMessage::ForceClose { src, dst, connection_id })
        }
        _ => None,
    }
}

pub fn envelope<T>(
    src: &str,
    dst: &str,
    connection_id: &ConnectionId,
    connection_type: ConnectionType,
    payload: T,
) -> Envelope<T> {
    Envelope {
        src: PeerId::from(src),
        dst: PeerId::from(dst),
        connection_id: connection_id.clone(),
        connection_type,
        room_name: None,
        label: None,
        serialization: None,
        metadata: None,
        payload,
    }
}

/// Everything currently buffered on a peer's event stream.
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
