use trellis::engine::MediaStream;
use trellis::error::ErrorKind;
use trellis::peer::PeerEvent;
use trellis_core::model::{ClientMessage, ConnectionId, ConnectionType, ServerMessage};

use crate::integration::{init_tracing, open_peer};
use crate::utils::{drain_events, envelope, remote_offer};

#[tokio::test]
async fn test_incoming_media_waits_for_explicit_answer() {
    init_tracing();

    let (mut bob, mut events, signals, factory) = open_peer("bob").await;
    let id = ConnectionId::generate(ConnectionType::Media);
    bob.dispatch(ServerMessage::Offer(envelope(
        "alice",
        "bob",
        &id,
        ConnectionType::Media,
        remote_offer("offer-from-alice"),
    )))
    .await;

    let incoming = drain_events(&mut events);
    assert!(
        incoming.iter().any(|e| matches!(
            e,
            PeerEvent::IncomingConnection { kind: ConnectionType::Media, .. }
        )),
        "incoming media surfaces to the application"
    );
    // No session until the application accepts.
    assert_eq!(factory.engine_count().await, 0);

    bob.answer(&id, MediaStream::with_id("ms-bob"))
        .await
        .expect("answer failed");

    assert_eq!(factory.engine_count().await, 1);
    assert_eq!(
        signals
            .count_matching(|m| matches!(m, ClientMessage::SendAnswer(_)))
            .await,
        1
    );
    let after = drain_events(&mut events);
    assert!(after.iter().any(|e| matches!(e, PeerEvent::ConnectionOpen { .. })));

    // Answering the same session twice is rejected.
    let err = bob
        .answer(&id, MediaStream::with_id("ms-bob-2"))
        .await
        .expect_err("second answer must fail");
    assert_eq!(err.kind, ErrorKind::Validation);
}
