use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use trellis::signaling::{SignalingError, SignalingTransport};
use trellis_core::model::{ClientMessage, ServerMessage};

/// Mock transport that captures all outgoing client messages.
#[derive(Clone)]
pub struct MockSignaling {
    signals: Arc<Mutex<Vec<ClientMessage>>>,
    connected: Arc<Mutex<bool>>,
}

impl MockSignaling {
    pub fn new() -> (Self, MockSignalingHandle) {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let connected = Arc::new(Mutex::new(true));
        let transport = Self { signals: signals.clone(), connected: connected.clone() };
        (transport, MockSignalingHandle { signals, connected })
    }
}

/// Test-side view of a `MockSignaling`.
pub struct MockSignalingHandle {
    signals: Arc<Mutex<Vec<ClientMessage>>>,
    connected: Arc<Mutex<bool>>,
}

impl MockSignalingHandle {
    pub async fn sent(&self) -> Vec<ClientMessage> {
        self.signals.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.signals.lock().await.clear();
    }

    pub async fn count_matching(&self, f: impl Fn(&ClientMessage) -> bool) -> usize {
        self.signals.lock().await.iter().filter(|m| f(m)).count()
    }

    /// Simulate a dead transport: every later send fails.
    pub async fn break_transport(&self) {
        *self.connected.lock().await = false;
    }
}

#[async_trait]
impl SignalingTransport for MockSignaling {
    async fn send(&mut self, message: ClientMessage) -> Result<(), SignalingError> {
        if !*self.connected.lock().await {
            return Err(SignalingError::NotConnected);
        }
        self.signals.lock().await.push(message);
        Ok(())
    }

    async fn close(&mut self) {
        *self.connected.lock().await = false;
    }

    async fn reconnect(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<ServerMessage>, SignalingError> {
        *self.connected.lock().await = true;
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(rx)
    }
}
