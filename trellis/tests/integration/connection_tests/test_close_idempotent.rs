use trellis::connection::DataConnectionOptions;
use trellis::peer::PeerEvent;
use trellis_core::model::{ClientMessage, PeerId};

use crate::integration::{init_tracing, open_peer};
use crate::utils::drain_events;

#[tokio::test]
async fn test_close_is_idempotent() {
    init_tracing();

    let (mut alice, mut events, signals, _factory) = open_peer("alice").await;
    let id = alice
        .connect(PeerId::from("bob"), DataConnectionOptions::default())
        .await
        .expect("connect failed");
    drain_events(&mut events);
    signals.clear().await;

    alice.close_connection(&id).await;

    let closed = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, PeerEvent::ConnectionClosed { .. }))
        .count();
    assert_eq!(closed, 1, "first close emits exactly one Closed event");
    assert_eq!(
        signals
            .count_matching(|m| matches!(m, ClientMessage::SendForceClose { .. }))
            .await,
        1,
        "caller-initiated close tells the remote mirror to tear down"
    );
    assert!(alice.connection(&id).is_none());

    // Second close finds nothing and stays silent.
    alice.close_connection(&id).await;
    assert!(drain_events(&mut events).is_empty());
    assert_eq!(
        signals
            .count_matching(|m| matches!(m, ClientMessage::SendForceClose { .. }))
            .await,
        1
    );
}
