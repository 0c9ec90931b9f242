use trellis::peer::PeerEvent;
use trellis_core::model::{ClientMessage, ConnectionType, PeerId, RoomMode, RoomName, ServerMessage};

use crate::integration::{init_tracing, open_peer};
use crate::utils::drain_events;

#[tokio::test]
async fn test_mesh_room_membership_and_fanout() {
    init_tracing();

    let (mut alice, mut events, signals, factory) = open_peer("alice").await;
    let name = RoomName::from("lobby");

    alice
        .join_room(name.clone(), RoomMode::Mesh, None)
        .await
        .expect("join failed");
    assert_eq!(
        signals
            .count_matching(|m| matches!(m, ClientMessage::RoomJoin { .. }))
            .await,
        1
    );

    // Our own join confirmation opens the room.
    alice
        .dispatch(ServerMessage::RoomUserJoin { src: PeerId::from("alice"), room_name: name.clone() })
        .await;
    assert!(
        drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, PeerEvent::RoomOpen(_)))
    );

    alice
        .dispatch(ServerMessage::RoomUserJoin { src: PeerId::from("bob"), room_name: name.clone() })
        .await;
    assert!(matches!(
        drain_events(&mut events).as_slice(),
        [PeerEvent::RoomPeerJoined { peer_id, .. }] if peer_id.as_str() == "bob"
    ));

    // Fan out data connections; the member list includes ourselves, which
    // must be skipped.
    alice.connect_room(&name).await.expect("connect_room failed");
    signals.clear().await;
    alice
        .dispatch(ServerMessage::RoomUsers {
            room_name: name.clone(),
            user_list: vec![PeerId::from("alice"), PeerId::from("bob")],
            kind: ConnectionType::Data,
        })
        .await;
    assert_eq!(factory.engine_count().await, 1, "one session, none to ourselves");
    assert_eq!(
        signals
            .count_matching(|m| matches!(
                m,
                ClientMessage::SendOffer(env) if env.room_name.as_ref() == Some(&name)
            ))
            .await,
        1
    );

    // A repeated member list does not duplicate sessions.
    alice
        .dispatch(ServerMessage::RoomUsers {
            room_name: name.clone(),
            user_list: vec![PeerId::from("bob")],
            kind: ConnectionType::Data,
        })
        .await;
    assert_eq!(factory.engine_count().await, 1);

    alice
        .dispatch(ServerMessage::RoomUserLeave { src: PeerId::from("bob"), room_name: name.clone() })
        .await;
    assert!(matches!(
        drain_events(&mut events).as_slice(),
        [PeerEvent::RoomPeerLeft { peer_id, .. }] if peer_id.as_str() == "bob"
    ));
}
