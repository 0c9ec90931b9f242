use super::{ConnectionCore, ConnectionEvent};
use crate::error::Error;
use bytes::Bytes;
use tracing::warn;
use trellis_core::model::{
    ConnectionId, ConnectionType, DataPayload, PeerId, Reassembly, Serialization, decode_chunk,
    encode_chunk, split_payload,
};

/// Default per-message ceiling for the underlying channel. Chunk bodies are
/// sized to fit under this after envelope overhead.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Default)]
pub struct DataConnectionOptions {
    pub connection_id: Option<ConnectionId>,
    pub label: Option<String>,
    pub serialization: Serialization,
    pub metadata: Option<serde_json::Value>,
}

/// Point-to-point data session with framing for arbitrarily large payloads
/// over a channel with a maximum per-message size.
pub struct DataConnection {
    pub(crate) core: ConnectionCore,
    serialization: Serialization,
    label: String,
    reassembly: Reassembly,
    send_queue: std::collections::VecDeque<Bytes>,
    max_message_size: usize,
}

impl DataConnection {
    pub fn new(remote_id: PeerId, originator: bool, options: DataConnectionOptions) -> Self {
        let core = ConnectionCore::new(
            remote_id,
            ConnectionType::Data,
            options.connection_id,
            options.metadata,
            originator,
        );
        let label = options.label.unwrap_or_else(|| core.id.to_string());
        Self {
            core,
            serialization: options.serialization,
            label,
            reassembly: Reassembly::new(),
            send_queue: std::collections::VecDeque::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn serialization(&self) -> Serialization {
        self.serialization
    }

    pub(crate) fn send_queue_is_empty(&self) -> bool {
        self.send_queue.is_empty()
    }

    pub(crate) fn pop_chunk(&mut self) -> Option<Bytes> {
        self.send_queue.pop_front()
    }

    pub(crate) fn requeue_front(&mut self, chunk: Bytes) {
        self.send_queue.push_front(chunk);
    }

    /// Frame and enqueue a payload. Not-open is an error event, never a
    /// panic; an empty payload is silently dropped.
    pub(crate) fn send(&mut self, payload: DataPayload) -> Vec<ConnectionEvent> {
        if !self.core.open || self.core.closed {
            return vec![ConnectionEvent::Error(Error::data(
                "cannot send: connection is not open",
            ))];
        }
        if payload.is_empty() {
            return Vec::new();
        }

        match self.serialization {
            Serialization::Json => {
                let body = match payload {
                    DataPayload::Json(s) | DataPayload::Text(s) => s,
                    DataPayload::Binary(_) => {
                        return vec![ConnectionEvent::Error(Error::validation(
                            "json serialization requires a text payload",
                        ))];
                    }
                };
                self.send_queue.push_back(Bytes::from(body));
            }
            Serialization::None => {
                // Passthrough; the caller owns size limits in this mode.
                let body = match payload {
                    DataPayload::Binary(b) => b,
                    DataPayload::Text(s) | DataPayload::Json(s) => s.into_bytes(),
                };
                self.send_queue.push_back(Bytes::from(body));
            }
            Serialization::Binary | Serialization::BinaryUtf8 => {
                let msg_id = rand::random::<u32>();
                let chunks = match split_payload(&payload, msg_id, self.max_message_size) {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        return vec![ConnectionEvent::Error(Error::data(e.to_string()))];
                    }
                };
                for chunk in &chunks {
                    match encode_chunk(chunk) {
                        Ok(bytes) => self.send_queue.push_back(Bytes::from(bytes)),
                        Err(e) => {
                            return vec![ConnectionEvent::Error(Error::data(e.to_string()))];
                        }
                    }
                }
            }
        }
        vec![ConnectionEvent::DrainRequested]
    }

    /// Inbound channel traffic. Malformed frames are a protocol error:
    /// logged and dropped, never fatal.
    pub(crate) fn handle_incoming(&mut self, bytes: Bytes) -> Vec<ConnectionEvent> {
        match self.serialization {
            Serialization::Json => match String::from_utf8(bytes.to_vec()) {
                Ok(s) => vec![ConnectionEvent::Data(DataPayload::Json(s))],
                Err(_) => {
                    warn!("non-utf8 frame on json connection {}, dropping", self.core.id);
                    Vec::new()
                }
            },
            Serialization::None => {
                vec![ConnectionEvent::Data(DataPayload::Binary(bytes.to_vec()))]
            }
            Serialization::Binary | Serialization::BinaryUtf8 => {
                let chunk = match decode_chunk(&bytes) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("malformed chunk on {}: {e}", self.core.id);
                        return Vec::new();
                    }
                };
                match self.reassembly.accept(chunk) {
                    Ok(Some(payload)) => vec![ConnectionEvent::Data(payload)],
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        warn!("chunk reassembly failed on {}: {e}", self.core.id);
                        Vec::new()
                    }
                }
            }
        }
    }
}
