use bytes::Bytes;
use trellis::connection::DataConnectionOptions;
use trellis::engine::EngineEvent;
use trellis::peer::PeerEvent;
use trellis_core::model::{DataPayload, PeerId, decode_chunk};

use crate::integration::{init_tracing, open_peer};
use crate::utils::{drain_events, relay};

/// Two large payloads, their chunks interleaved on the wire, both
/// reassembled intact on the far side.
#[tokio::test]
async fn test_chunked_payloads_survive_interleaving() {
    init_tracing();

    let (mut alice, mut alice_events, alice_signals, alice_factory) = open_peer("alice").await;
    let (mut bob, mut bob_events, bob_signals, _bob_factory) = open_peer("bob").await;

    let id = alice
        .connect(PeerId::from("bob"), DataConnectionOptions::default())
        .await
        .expect("connect failed");

    // Full signaling loop: offer over, answer back, candidates both ways.
    for message in alice_signals.sent().await {
        if let Some(server) = relay(message) {
            bob.dispatch(server).await;
        }
    }
    alice_signals.clear().await;
    for message in bob_signals.sent().await {
        if let Some(server) = relay(message) {
            alice.dispatch(server).await;
        }
    }

    alice.route_engine_event(&id, EngineEvent::DataChannelOpen).await;
    bob.route_engine_event(&id, EngineEvent::DataChannelOpen).await;
    drain_events(&mut alice_events);
    drain_events(&mut bob_events);

    let first = vec![0xAB_u8; 40_000];
    let second = "x".repeat(35_000);
    alice
        .send(&id, DataPayload::Binary(first.clone()))
        .await
        .expect("send failed");
    alice
        .send(&id, DataPayload::Text(second.clone()))
        .await
        .expect("send failed");

    let wire = {
        let state = alice_factory.state_of(&id).await.expect("engine exists");
        let state = state.lock().await;
        state.sent.clone()
    };
    let first_total = decode_chunk(&wire[0]).expect("chunk decodes").total as usize;
    assert!(first_total > 1, "a 40k payload needs several chunks");
    assert!(wire.len() > first_total);

    // Interleave the two messages' chunks before delivery.
    let (first_chunks, second_chunks) = wire.split_at(first_total);
    let mut a = first_chunks.iter();
    let mut b = second_chunks.iter();
    let mut interleaved: Vec<Bytes> = Vec::new();
    loop {
        match (a.next(), b.next()) {
            (None, None) => break,
            (x, y) => {
                interleaved.extend(x.cloned());
                interleaved.extend(y.cloned());
            }
        }
    }
    for frame in interleaved {
        bob.route_engine_event(&id, EngineEvent::DataReceived(frame)).await;
    }

    let received: Vec<DataPayload> = drain_events(&mut bob_events)
        .into_iter()
        .filter_map(|e| match e {
            PeerEvent::Data { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(received.len(), 2, "each payload is emitted exactly once");
    assert!(received.contains(&DataPayload::Binary(first)));
    assert!(received.contains(&DataPayload::Text(second)));
}
