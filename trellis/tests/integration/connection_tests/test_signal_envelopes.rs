use trellis::connection::{
    Connection, ConnectionEvent, DataConnection, DataConnectionOptions, signal_message,
};
use trellis_core::model::{ClientMessage, ConnectionType, PeerId, Serialization};

use crate::utils::{candidate, remote_offer};

/// Offer and candidate events address the same session; only the offer
/// carries the channel metadata the remote side needs to mirror it.
#[test]
fn test_offer_and_candidate_envelopes_address_the_same_session() {
    let connection = Connection::Data(DataConnection::new(
        PeerId::from("bob"),
        true,
        DataConnectionOptions {
            label: Some("chat".to_string()),
            serialization: Serialization::Json,
            ..DataConnectionOptions::default()
        },
    ));
    let local = PeerId::from("alice");

    let offer = signal_message(
        &connection,
        &local,
        None,
        &ConnectionEvent::SignalOffer(remote_offer("sdp-1")),
    );
    let Some(ClientMessage::SendOffer(env)) = offer else {
        panic!("offer event maps to SEND_OFFER");
    };
    assert_eq!(env.src, local);
    assert_eq!(env.dst, PeerId::from("bob"));
    assert_eq!(env.connection_id, *connection.id());
    assert_eq!(env.connection_type, ConnectionType::Data);
    assert_eq!(env.label.as_deref(), Some("chat"));
    assert_eq!(env.serialization, Some(Serialization::Json));
    assert_eq!(env.payload.sdp, "sdp-1");

    let cand = signal_message(
        &connection,
        &local,
        None,
        &ConnectionEvent::SignalCandidate(candidate("cand-1")),
    );
    let Some(ClientMessage::SendCandidate(env)) = cand else {
        panic!("candidate event maps to SEND_CANDIDATE");
    };
    assert_eq!(env.connection_id, *connection.id());
    assert_eq!(env.payload.candidate, "cand-1");
    assert!(env.label.is_none());
    assert!(env.serialization.is_none());
}
