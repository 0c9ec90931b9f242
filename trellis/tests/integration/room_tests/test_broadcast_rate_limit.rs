use serde_json::json;
use trellis::room::{MeshRoom, Room, RoomEvent};
use trellis_core::model::{ClientMessage, PeerId, RoomName};

use crate::integration::init_tracing;

/// Five sends inside one interval: the first goes straight out, the rest
/// queue and drain in order on timer ticks.
#[tokio::test(start_paused = true)]
async fn test_rapid_room_sends_are_throttled() {
    init_tracing();

    let mut room = Room::Mesh(MeshRoom::new(
        RoomName::from("lobby"),
        PeerId::from("alice"),
        None,
    ));

    let mut immediate = 0;
    let mut timer_starts = 0;
    for i in 0..5 {
        for event in room.send_data(json!({ "seq": i })).expect("send failed") {
            match event {
                RoomEvent::Signal(_) => immediate += 1,
                RoomEvent::StartBroadcastTimer => timer_starts += 1,
                other => panic!("unexpected room event {other:?}"),
            }
        }
    }
    assert_eq!(immediate, 1);
    assert_eq!(timer_starts, 1);

    let mut drained = Vec::new();
    loop {
        let (message, done) = room.drain_broadcast();
        if let Some(ClientMessage::RoomSendData { data, .. }) = message {
            drained.push(data["seq"].as_i64().expect("seq present"));
        }
        if done {
            break;
        }
    }
    assert_eq!(drained, vec![1, 2, 3, 4], "backlog drains in send order");
}
