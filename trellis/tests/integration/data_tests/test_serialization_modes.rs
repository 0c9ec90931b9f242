use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use trellis::connection::DataConnectionOptions;
use trellis::engine::EngineEvent;
use trellis::error::ErrorKind;
use trellis::peer::{Peer, PeerEvent};
use trellis_core::model::{ConnectionId, DataPayload, PeerId, Serialization, decode_chunk};

use crate::integration::{init_tracing, open_peer};
use crate::utils::{MockEngineFactory, MockSignalingHandle, drain_events};

async fn open_data_connection(
    serialization: Serialization,
) -> (
    Peer,
    mpsc::UnboundedReceiver<PeerEvent>,
    MockSignalingHandle,
    Arc<MockEngineFactory>,
    ConnectionId,
) {
    init_tracing();
    let (mut alice, mut events, signals, factory) = open_peer("alice").await;
    let id = alice
        .connect(
            PeerId::from("bob"),
            DataConnectionOptions { serialization, ..DataConnectionOptions::default() },
        )
        .await
        .expect("connect failed");
    alice.route_engine_event(&id, EngineEvent::DataChannelOpen).await;
    drain_events(&mut events);
    (alice, events, signals, factory, id)
}

#[tokio::test]
async fn test_json_mode_passes_text_through_and_rejects_binary() {
    let (mut alice, mut events, _signals, factory, id) =
        open_data_connection(Serialization::Json).await;

    alice
        .send(&id, DataPayload::Text(r#"{"a":1}"#.to_string()))
        .await
        .expect("send failed");
    {
        let state = factory.sole_state().await;
        let state = state.lock().await;
        assert_eq!(state.sent.as_slice(), [Bytes::from(r#"{"a":1}"#)]);
    }
    drain_events(&mut events);

    alice
        .send(&id, DataPayload::Binary(vec![0xFF, 0xFE]))
        .await
        .expect("send failed");
    let errors: Vec<ErrorKind> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            PeerEvent::Error(err) => Some(err.kind),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![ErrorKind::Validation]);
}

#[tokio::test]
async fn test_json_mode_drops_non_utf8_inbound_frames() {
    let (mut alice, mut events, _signals, _factory, id) =
        open_data_connection(Serialization::Json).await;

    alice
        .route_engine_event(&id, EngineEvent::DataReceived(Bytes::from_static(&[0xFF, 0xFE])))
        .await;
    assert!(drain_events(&mut events).is_empty(), "malformed frame is dropped, not fatal");

    alice
        .route_engine_event(&id, EngineEvent::DataReceived(Bytes::from(r#"{"b":2}"#)))
        .await;
    let received = drain_events(&mut events);
    assert!(matches!(
        received.as_slice(),
        [PeerEvent::Data { payload: DataPayload::Json(s), .. }] if s == r#"{"b":2}"#
    ));
}

#[tokio::test]
async fn test_none_mode_is_byte_exact_passthrough() {
    let (mut alice, mut events, _signals, factory, id) =
        open_data_connection(Serialization::None).await;

    let raw = vec![0x00, 0xFF, 0x10, 0x20];
    alice
        .send(&id, DataPayload::Binary(raw.clone()))
        .await
        .expect("send failed");
    {
        let state = factory.sole_state().await;
        let state = state.lock().await;
        assert_eq!(state.sent.as_slice(), [Bytes::from(raw.clone())]);
    }

    alice
        .route_engine_event(&id, EngineEvent::DataReceived(Bytes::from(raw.clone())))
        .await;
    let received = drain_events(&mut events);
    assert!(matches!(
        received.as_slice(),
        [PeerEvent::Data { payload: DataPayload::Binary(b), .. }] if *b == raw
    ));
}

#[tokio::test]
async fn test_binary_mode_frames_with_the_chunk_codec() {
    let (mut alice, _events, _signals, factory, id) =
        open_data_connection(Serialization::Binary).await;

    alice
        .send(&id, DataPayload::Binary(vec![1, 2, 3]))
        .await
        .expect("send failed");

    let state = factory.sole_state().await;
    let state = state.lock().await;
    assert_eq!(state.sent.len(), 1, "a small payload fits one chunk");
    let chunk = decode_chunk(&state.sent[0]).expect("frame is a chunk");
    assert_eq!(chunk.index, 0);
    assert_eq!(chunk.total, 1);
}
