pub mod connection_tests;
pub mod data_tests;
pub mod room_tests;
pub mod signaling_tests;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Level;

use trellis::peer::{Peer, PeerEvent, PeerOptions};
use trellis_core::model::{PeerId, ServerMessage};

use crate::utils::{MockEngineFactory, MockSignaling, MockSignalingHandle};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A peer already confirmed by the relay, wired to mock signaling and a
/// mock engine factory.
pub async fn open_peer(
    id: &str,
) -> (
    Peer,
    mpsc::UnboundedReceiver<PeerEvent>,
    MockSignalingHandle,
    Arc<MockEngineFactory>,
) {
    let (signaling, handle) = MockSignaling::new();
    let factory = MockEngineFactory::new();
    let (mut peer, events) = Peer::new(
        Box::new(signaling),
        factory.clone(),
        PeerOptions { id: Some(PeerId::from(id)), ..PeerOptions::default() },
    );
    peer.dispatch(ServerMessage::Open { peer_id: PeerId::from(id), turn_credential: None })
        .await;
    (peer, events, handle, factory)
}
