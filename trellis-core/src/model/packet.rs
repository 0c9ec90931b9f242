use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Payload of one logical data-channel message, tagged with its declared
/// kind so the receiver can re-materialize the original after reassembly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataPayload {
    Binary(#[serde(with = "serde_bytes")] Vec<u8>),
    Text(String),
    Json(String),
}

impl DataPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Binary(b) => b.is_empty(),
            Self::Text(s) | Self::Json(s) => s.is_empty(),
        }
    }
}

/// One size-bounded part of a chunked payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub msg_id: u32,
    pub index: u16,
    pub total: u16,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

/// Worst-case postcard envelope size for `Chunk` excluding the body bytes:
/// three varints plus the body length prefix.
pub const CHUNK_OVERHEAD: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("chunk ceiling {0} too small for envelope overhead")]
    CeilingTooSmall(usize),
    #[error("payload of {parts} parts exceeds the part-count limit")]
    TooManyParts { parts: usize },
    #[error("malformed chunk: {0}")]
    Malformed(String),
    #[error("chunk index {index} out of range for total {total}")]
    IndexOutOfRange { index: u16, total: u16 },
    #[error("inconsistent total for message {msg_id}")]
    InconsistentTotal { msg_id: u32 },
}

/// Slice an encoded payload into chunks whose encoded form fits under
/// `max_message_size`. A payload that fits in one part still gets the
/// envelope so the receive path stays uniform.
pub fn split_payload(
    payload: &DataPayload,
    msg_id: u32,
    max_message_size: usize,
) -> Result<Vec<Chunk>, PacketError> {
    if max_message_size <= CHUNK_OVERHEAD {
        return Err(PacketError::CeilingTooSmall(max_message_size));
    }
    let encoded =
        postcard::to_allocvec(payload).map_err(|e| PacketError::Malformed(e.to_string()))?;
    let body_ceiling = max_message_size - CHUNK_OVERHEAD;

    let parts = encoded.len().div_ceil(body_ceiling).max(1);
    if parts > usize::from(u16::MAX) {
        return Err(PacketError::TooManyParts { parts });
    }
    let total = parts as u16;

    let chunks = (0..parts)
        .map(|i| {
            let start = i * body_ceiling;
            let end = (start + body_ceiling).min(encoded.len());
            Chunk {
                msg_id,
                index: i as u16,
                total,
                body: encoded[start..end].to_vec(),
            }
        })
        .collect();
    Ok(chunks)
}

pub fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>, PacketError> {
    postcard::to_allocvec(chunk).map_err(|e| PacketError::Malformed(e.to_string()))
}

pub fn decode_chunk(bytes: &[u8]) -> Result<Chunk, PacketError> {
    postcard::from_bytes(bytes).map_err(|e| PacketError::Malformed(e.to_string()))
}

struct PartialMessage {
    total: u16,
    received: u16,
    parts: Vec<Option<Vec<u8>>>,
}

/// Accumulates chunks per message id and yields each payload exactly once,
/// when all parts have arrived. Duplicate parts are ignored; arrival order
/// does not matter.
#[derive(Default)]
pub struct Reassembly {
    pending: HashMap<u32, PartialMessage>,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_messages(&self) -> usize {
        self.pending.len()
    }

    pub fn accept(&mut self, chunk: Chunk) -> Result<Option<DataPayload>, PacketError> {
        if chunk.total == 0 || chunk.index >= chunk.total {
            return Err(PacketError::IndexOutOfRange {
                index: chunk.index,
                total: chunk.total,
            });
        }

        let entry = self.pending.entry(chunk.msg_id).or_insert_with(|| PartialMessage {
            total: chunk.total,
            received: 0,
            parts: vec![None; usize::from(chunk.total)],
        });
        if entry.total != chunk.total {
            let msg_id = chunk.msg_id;
            self.pending.remove(&msg_id);
            return Err(PacketError::InconsistentTotal { msg_id });
        }

        let slot = &mut entry.parts[usize::from(chunk.index)];
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(chunk.body);
        entry.received += 1;

        if entry.received < entry.total {
            return Ok(None);
        }

        let entry = self
            .pending
            .remove(&chunk.msg_id)
            .ok_or(PacketError::InconsistentTotal { msg_id: chunk.msg_id })?;
        let mut bytes = Vec::new();
        for part in entry.parts {
            match part {
                Some(body) => bytes.extend_from_slice(&body),
                None => return Err(PacketError::InconsistentTotal { msg_id: chunk.msg_id }),
            }
        }
        let payload =
            postcard::from_bytes(&bytes).map_err(|e| PacketError::Malformed(e.to_string()))?;
        Ok(Some(payload))
    }
}
