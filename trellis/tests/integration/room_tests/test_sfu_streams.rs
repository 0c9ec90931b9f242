use std::collections::HashMap;
use trellis::engine::{EngineEvent, MediaStream};
use trellis::peer::PeerEvent;
use trellis_core::model::{ClientMessage, PeerId, RoomMode, RoomName, ServerMessage};

use crate::integration::{init_tracing, open_peer};
use crate::utils::{drain_events, remote_offer};

#[tokio::test]
async fn test_unknown_streams_park_until_their_owner_is_known() {
    init_tracing();

    let (mut alice, mut events, signals, factory) = open_peer("alice").await;
    let name = RoomName::from("studio");

    alice
        .join_room(name.clone(), RoomMode::Sfu, Some(MediaStream::with_id("ms-alice")))
        .await
        .expect("join failed");
    alice
        .dispatch(ServerMessage::RoomUserJoin { src: PeerId::from("alice"), room_name: name.clone() })
        .await;
    assert_eq!(
        signals
            .count_matching(|m| matches!(m, ClientMessage::SfuGetOffer { .. }))
            .await,
        1
    );
    drain_events(&mut events);

    // First relay offer: creates the upstream session and answers it.
    let mut msids = HashMap::new();
    msids.insert("ms-alice".to_string(), PeerId::from("alice"));
    alice
        .dispatch(ServerMessage::SfuOffer {
            room_name: name.clone(),
            offer: remote_offer("sfu-round-1"),
            msids: msids.clone(),
        })
        .await;
    assert_eq!(factory.engine_count().await, 1);
    assert_eq!(
        signals
            .count_matching(|m| matches!(m, ClientMessage::SfuAnswer { .. }))
            .await,
        1
    );
    let upstream = factory.ids().await.remove(0);
    drain_events(&mut events);

    // A track shows up before its owner is in the msid map: parked.
    alice
        .route_engine_event(&upstream, EngineEvent::StreamAdded(MediaStream::with_id("ms-bob")))
        .await;
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, PeerEvent::RoomStream { .. })),
        "ownerless stream must not surface"
    );

    // The next relay offer names the owner: promotion, exactly once.
    msids.insert("ms-bob".to_string(), PeerId::from("bob"));
    alice
        .dispatch(ServerMessage::SfuOffer {
            room_name: name.clone(),
            offer: remote_offer("sfu-round-2"),
            msids: msids.clone(),
        })
        .await;
    let streams: Vec<PeerId> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            PeerEvent::RoomStream { peer_id, .. } => Some(peer_id),
            _ => None,
        })
        .collect();
    assert_eq!(streams, vec![PeerId::from("bob")]);

    // A duplicate engine report of the same stream stays suppressed.
    alice
        .route_engine_event(&upstream, EngineEvent::StreamAdded(MediaStream::with_id("ms-bob")))
        .await;
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, PeerEvent::RoomStream { .. }))
    );

    // Our own loopback track is swallowed.
    alice
        .route_engine_event(&upstream, EngineEvent::StreamAdded(MediaStream::with_id("ms-alice")))
        .await;
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, PeerEvent::RoomStream { .. }))
    );
}
