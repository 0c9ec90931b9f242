use bytes::Bytes;
use trellis::connection::DataConnectionOptions;
use trellis::engine::{EngineError, EngineEvent};
use trellis_core::model::{DataPayload, PeerId, Serialization};

use crate::integration::{init_tracing, open_peer};
use crate::utils::drain_events;

/// A busy channel must not stall the control loop: the chunk goes back on
/// the queue and a later drain tick delivers it.
#[tokio::test]
async fn test_busy_channel_defers_the_drain() {
    init_tracing();

    let (mut alice, mut events, _signals, factory) = open_peer("alice").await;
    let id = alice
        .connect(
            PeerId::from("bob"),
            DataConnectionOptions {
                serialization: Serialization::None,
                ..DataConnectionOptions::default()
            },
        )
        .await
        .expect("connect failed");
    alice.route_engine_event(&id, EngineEvent::DataChannelOpen).await;
    drain_events(&mut events);

    let state = factory.sole_state().await;
    state.lock().await.send_errors.push_back(EngineError::ChannelBusy);

    alice
        .send(&id, DataPayload::Text("hello".to_string()))
        .await
        .expect("send failed");
    assert!(
        state.lock().await.sent.is_empty(),
        "the busy channel took nothing and the send returned promptly"
    );

    alice.drain_tick(id.clone()).await;
    let state = state.lock().await;
    assert_eq!(state.sent.as_slice(), [Bytes::from("hello")]);
}
