use trellis::connection::DataConnectionOptions;
use trellis::error::ErrorKind;
use trellis::peer::PeerEvent;
use trellis_core::model::{DataPayload, PeerId};

use crate::integration::{init_tracing, open_peer};
use crate::utils::drain_events;

#[tokio::test]
async fn test_send_before_open_is_an_error_and_touches_nothing() {
    init_tracing();

    let (mut alice, mut events, _signals, factory) = open_peer("alice").await;
    let id = alice
        .connect(PeerId::from("bob"), DataConnectionOptions::default())
        .await
        .expect("connect failed");
    drain_events(&mut events);

    // The channel never opened; sending must fail loudly but harmlessly.
    alice
        .send(&id, DataPayload::Text("too early".to_string()))
        .await
        .expect("send itself does not error, it reports through events");

    let errors: Vec<ErrorKind> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            PeerEvent::Error(err) => Some(err.kind),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![ErrorKind::Data]);

    let state = factory.sole_state().await;
    assert!(state.lock().await.sent.is_empty(), "nothing reached the channel");
}
