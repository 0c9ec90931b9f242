use trellis::connection::DataConnectionOptions;
use trellis_core::model::{ClientMessage, ConnectionType, Envelope, PeerId, ServerMessage};

use crate::integration::{init_tracing, open_peer};
use crate::utils::{candidate, envelope, remote_answer};

#[tokio::test]
async fn test_originator_queues_candidates_until_answer() {
    init_tracing();

    let (mut alice, _events, signals, factory) = open_peer("alice").await;
    let id = alice
        .connect(PeerId::from("bob"), DataConnectionOptions::default())
        .await
        .expect("connect failed");
    let state = factory.sole_state().await;

    let offer_env = signals
        .sent()
        .await
        .into_iter()
        .find_map(|m| match m {
            ClientMessage::SendOffer(env) => Some(env),
            _ => None,
        })
        .expect("originator sent an offer");

    // Candidate before the remote answer: must not reach the engine.
    alice
        .dispatch(ServerMessage::Candidate(envelope(
            "bob",
            "alice",
            &id,
            ConnectionType::Data,
            candidate("cand-1"),
        )))
        .await;
    assert!(state.lock().await.candidates.is_empty());

    // The answer lands, the queued candidate drains behind it.
    alice
        .dispatch(ServerMessage::Answer(Envelope {
            src: PeerId::from("bob"),
            dst: PeerId::from("alice"),
            payload: remote_answer("answer-from-bob"),
            ..offer_env
        }))
        .await;

    let state = state.lock().await;
    assert_eq!(state.remote_descriptions.len(), 1);
    assert_eq!(state.candidates.len(), 1);
    assert_eq!(state.candidates[0].candidate, "cand-1");
}
