use super::{SignalingError, SignalingTransport};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use trellis_core::model::{ClientMessage, ServerMessage};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Websocket relay client. A spawned reader task decodes inbound frames
/// onto an unbounded channel; undecodable frames are logged and dropped.
/// Messages sent before the session exists are buffered and flushed on
/// connect.
pub struct WsSignaling {
    url: String,
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
    queued: Vec<ClientMessage>,
}

impl WsSignaling {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), sink: None, reader: None, queued: Vec::new() }
    }

    pub async fn connect(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<ServerMessage>, SignalingError> {
        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| SignalingError::WebSocket(e.to_string()))?;
        debug!("signaling connected to {}", self.url);
        let (sink, source) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(source, tx));

        self.sink = Some(sink);
        if let Some(old) = self.reader.replace(reader) {
            old.abort();
        }
        let backlog = std::mem::take(&mut self.queued);
        for message in backlog {
            self.send(message).await?;
        }
        Ok(rx)
    }
}

async fn read_loop(mut source: WsSource, tx: mpsc::UnboundedSender<ServerMessage>) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("undecodable signaling frame, dropping: {e}"),
            },
            Ok(Message::Close(_)) => {
                debug!("signaling relay closed the session");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
            Err(e) => {
                warn!("signaling read failed: {e}");
                break;
            }
        }
    }
    // Dropping `tx` is how the control loop learns the session is gone.
}

#[async_trait]
impl SignalingTransport for WsSignaling {
    async fn send(&mut self, message: ClientMessage) -> Result<(), SignalingError> {
        let Some(sink) = self.sink.as_mut() else {
            // Not connected yet: hold the message for the next session.
            debug!("signaling not connected, buffering outbound message");
            self.queued.push(message);
            return Ok(());
        };
        let text = serde_json::to_string(&message)
            .map_err(|e| SignalingError::Encode(e.to_string()))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| SignalingError::WebSocket(e.to_string()))
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    async fn reconnect(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<ServerMessage>, SignalingError> {
        self.close().await;
        self.connect().await
    }
}
