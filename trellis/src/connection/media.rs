use super::{ConnectionCore, ConnectionEvent};
use crate::engine::MediaStream;
use crate::error::Error;
use tracing::warn;
use trellis_core::model::{ConnectionId, ConnectionType, PeerId, SessionDescription};

#[derive(Debug, Clone, Default)]
pub struct MediaConnectionOptions {
    pub connection_id: Option<ConnectionId>,
    pub metadata: Option<serde_json::Value>,
}

/// Point-to-point media session. The caller supplies the local stream; the
/// remote stream arrives from the engine and is cached so a twice-reported
/// stream is emitted once.
pub struct MediaConnection {
    pub(crate) core: ConnectionCore,
    pub(crate) local_stream: Option<MediaStream>,
    pub(crate) remote_stream: Option<MediaStream>,
}

impl MediaConnection {
    pub fn new(
        remote_id: PeerId,
        originator: bool,
        options: MediaConnectionOptions,
        local_stream: Option<MediaStream>,
    ) -> Self {
        Self {
            core: ConnectionCore::new(
                remote_id,
                ConnectionType::Media,
                options.connection_id,
                options.metadata,
                originator,
            ),
            local_stream,
            remote_stream: None,
        }
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    /// Accept an incoming call. Rejects a second answer on the same
    /// session; returns the stashed remote offer the negotiator must start
    /// from.
    pub(crate) fn prepare_answer(
        &mut self,
        stream: MediaStream,
    ) -> Result<SessionDescription, Error> {
        if self.local_stream.is_some() {
            warn!("local stream already set on {}, ignoring answer", self.core.id);
            return Err(Error::validation("connection was already answered"));
        }
        let offer = self
            .core
            .pending_offer
            .take()
            .ok_or_else(|| Error::validation("no pending offer to answer"))?;
        self.local_stream = Some(stream);
        Ok(offer)
    }

    pub(crate) fn set_local_stream(&mut self, stream: MediaStream) {
        self.local_stream = Some(stream);
    }
}

impl super::Connection {
    /// Swap the outgoing stream, renegotiating only when the engine cannot
    /// replace per-track.
    pub async fn replace_stream(&mut self, new_stream: MediaStream) -> Vec<ConnectionEvent> {
        let Self::Media(media) = self else {
            return vec![ConnectionEvent::Error(Error::validation(
                "replace_stream is only supported on media connections",
            ))];
        };
        let old = media.local_stream.clone();
        let Some(negotiator) = media.core.negotiator.as_mut() else {
            media.local_stream = Some(new_stream);
            return Vec::new();
        };
        let result = negotiator.replace_stream(old.as_ref(), &new_stream).await;
        media.set_local_stream(new_stream);
        self.settle(result).await
    }
}
