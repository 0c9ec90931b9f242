use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use trellis::engine::{
    DataChannelConfig, EngineConfig, EngineError, EngineEvent, EngineFactory, MediaStream,
    OfferOptions, SessionEngine, SignalingState,
};
use trellis_core::model::{ConnectionId, IceCandidateInit, SdpKind, SessionDescription};

/// Everything a mock session records, shared with the factory so tests can
/// inspect it after the fact.
#[derive(Default)]
pub struct MockEngineState {
    pub offers_created: u32,
    pub answers_created: u32,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidateInit>,
    pub channels: Vec<String>,
    pub sent: Vec<Bytes>,
    pub added_streams: Vec<String>,
    pub removed_streams: Vec<String>,
    pub receive_media: bool,
    pub replace_track_calls: u32,
    pub replace_track_supported: bool,
    pub closed: bool,
    /// Scripted failures for `send_data`, consumed front to back.
    pub send_errors: VecDeque<EngineError>,
    /// Scripted failures for `set_remote_description`.
    pub remote_description_errors: VecDeque<EngineError>,
}

pub struct MockEngine {
    id: ConnectionId,
    state: Arc<Mutex<MockEngineState>>,
}

#[async_trait]
impl SessionEngine for MockEngine {
    async fn create_offer(
        &mut self,
        _options: &OfferOptions,
    ) -> Result<SessionDescription, EngineError> {
        let mut state = self.state.lock().await;
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "offer-{}-{}",
            self.id, state.offers_created
        )))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        let mut state = self.state.lock().await;
        state.answers_created += 1;
        Ok(SessionDescription::answer(format!(
            "answer-{}-{}",
            self.id, state.answers_created
        )))
    }

    async fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError> {
        self.state.lock().await.local_descriptions.push(desc);
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.remote_description_errors.pop_front() {
            return Err(err);
        }
        state.remote_descriptions.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(
        &mut self,
        candidate: IceCandidateInit,
    ) -> Result<(), EngineError> {
        self.state.lock().await.candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        SignalingState::Stable
    }

    async fn create_data_channel(
        &mut self,
        label: &str,
        _config: &DataChannelConfig,
    ) -> Result<(), EngineError> {
        self.state.lock().await.channels.push(label.to_string());
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.send_errors.pop_front() {
            return Err(err);
        }
        state.sent.push(data);
        Ok(())
    }

    async fn add_stream(&mut self, stream: &MediaStream) -> Result<(), EngineError> {
        self.state.lock().await.added_streams.push(stream.id().to_string());
        Ok(())
    }

    async fn remove_stream(&mut self, stream: &MediaStream) -> Result<(), EngineError> {
        self.state.lock().await.removed_streams.push(stream.id().to_string());
        Ok(())
    }

    async fn replace_track(&mut self, _stream: &MediaStream) -> Result<bool, EngineError> {
        let mut state = self.state.lock().await;
        state.replace_track_calls += 1;
        Ok(state.replace_track_supported)
    }

    async fn receive_media(&mut self) -> Result<(), EngineError> {
        self.state.lock().await.receive_media = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

/// Hands out `MockEngine`s and keeps a handle on each one's state, keyed
/// by connection id.
#[derive(Default)]
pub struct MockEngineFactory {
    engines: Mutex<HashMap<ConnectionId, Arc<Mutex<MockEngineState>>>>,
}

impl MockEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn engine_count(&self) -> usize {
        self.engines.lock().await.len()
    }

    pub async fn state_of(&self, id: &ConnectionId) -> Option<Arc<Mutex<MockEngineState>>> {
        self.engines.lock().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.engines.lock().await.keys().cloned().collect()
    }

    /// The state of the only session created so far; panics when there is
    /// not exactly one.
    pub async fn sole_state(&self) -> Arc<Mutex<MockEngineState>> {
        let engines = self.engines.lock().await;
        assert_eq!(engines.len(), 1, "expected exactly one engine session");
        engines.values().next().cloned().unwrap()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(
        &self,
        id: ConnectionId,
        _config: EngineConfig,
        _events: mpsc::UnboundedSender<(ConnectionId, EngineEvent)>,
    ) -> Result<Box<dyn SessionEngine>, EngineError> {
        let state = Arc::new(Mutex::new(MockEngineState::default()));
        self.engines.lock().await.insert(id.clone(), state.clone());
        Ok(Box::new(MockEngine { id, state }))
    }
}

/// A remote offer the way the relay would carry it.
pub fn remote_offer(sdp: &str) -> SessionDescription {
    SessionDescription { kind: SdpKind::Offer, sdp: sdp.to_string() }
}

pub fn remote_answer(sdp: &str) -> SessionDescription {
    SessionDescription { kind: SdpKind::Answer, sdp: sdp.to_string() }
}

pub fn candidate(payload: &str) -> IceCandidateInit {
    IceCandidateInit {
        candidate: payload.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    }
}
