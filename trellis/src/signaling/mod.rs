//! Relay transport boundary. The control loop only sees a trait plus a
//! stream of decoded server messages; the websocket details stay in `ws`.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use trellis_core::model::{ClientMessage, ServerMessage};

mod ws;

pub use ws::WsSignaling;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("not connected to the signaling relay")]
    NotConnected,
    #[error("websocket failure: {0}")]
    WebSocket(String),
    #[error("could not encode signaling message: {0}")]
    Encode(String),
    #[error("signaling session closed")]
    Closed,
}

#[async_trait]
pub trait SignalingTransport: Send {
    async fn send(&mut self, message: ClientMessage) -> Result<(), SignalingError>;

    async fn close(&mut self);

    /// Tear down the current session (if any) and establish a new one,
    /// yielding the inbound message stream for it.
    async fn reconnect(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<ServerMessage>, SignalingError>;
}
