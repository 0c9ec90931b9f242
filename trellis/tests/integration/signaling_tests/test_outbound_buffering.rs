use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use trellis::signaling::{SignalingTransport, WsSignaling};
use trellis_core::model::{ClientMessage, RoomName};

use crate::integration::init_tracing;

/// A message sent before the websocket session exists is buffered and goes
/// out as the first frame once the session is up.
#[tokio::test]
async fn test_messages_sent_before_connect_flush_on_connect() {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept failed");
        let mut ws = accept_async(stream).await.expect("handshake failed");
        let frame = ws.next().await.expect("no frame").expect("read failed");
        match frame {
            Message::Text(text) => {
                serde_json::from_str::<ClientMessage>(&text).expect("undecodable frame")
            }
            other => panic!("unexpected frame {other:?}"),
        }
    });

    let mut signaling = WsSignaling::new(format!("ws://{addr}"));
    signaling
        .send(ClientMessage::RoomLeave { room_name: RoomName::from("lobby") })
        .await
        .expect("send while disconnected must buffer");
    let _inbound = signaling.connect().await.expect("connect failed");

    let received = server.await.expect("server task failed");
    assert!(matches!(
        received,
        ClientMessage::RoomLeave { room_name } if room_name == RoomName::from("lobby")
    ));
}
