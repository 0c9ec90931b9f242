use super::{
    DataChannelConfig, EngineConfig, EngineError, EngineEvent, EngineFactory, MediaStream,
    OfferOptions, SessionEngine, SignalingState,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use trellis_core::model::{
    ConnectionId, IceCandidateInit, SdpKind, SessionDescription,
};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

/// Outbound messages sitting unsent in the channel beyond this are treated
/// as backpressure and reported as a transient rejection.
const BUFFERED_AMOUNT_CEILING: usize = 1 << 20;

/// `SessionEngine` backed by a webrtc-rs `RTCPeerConnection`.
pub struct RtcEngine {
    id: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    data_channel: Option<Arc<RTCDataChannel>>,
    senders: Vec<Arc<RTCRtpSender>>,
    events: mpsc::UnboundedSender<(ConnectionId, EngineEvent)>,
    closed: bool,
}

impl RtcEngine {
    pub async fn new(
        id: ConnectionId,
        config: EngineConfig,
        events: mpsc::UnboundedSender<(ConnectionId, EngineEvent)>,
    ) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(engine_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(engine_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls,
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(engine_err)?);

        // Connection-state monitoring: a Failed/Disconnected/Closed session
        // surfaces as Broken, which the negotiator turns into a plain close.
        let state_tx = events.clone();
        let state_id = id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            let id = state_id.clone();
            Box::pin(async move {
                info!("connection state for {id}: {state}");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed
                ) {
                    let _ = tx.send((id, EngineEvent::Broken));
                }
            })
        }));

        // Trickle ICE.
        let ice_tx = events.clone();
        let ice_id = id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = ice_tx.clone();
            let id = ice_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else {
                    return;
                };
                let _ = tx.send((
                    id,
                    EngineEvent::IceCandidate(IceCandidateInit {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    }),
                ));
            })
        }));

        let track_tx = events.clone();
        let track_id = id.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = track_tx.clone();
            let id = track_id.clone();
            Box::pin(async move {
                let stream_id = track.stream_id();
                debug!("remote track for {id}, stream {stream_id}");
                let _ = tx.send((id, EngineEvent::StreamAdded(MediaStream::with_id(stream_id))));
            })
        }));

        // The remote side may be the one creating the channel.
        let dc_tx = events.clone();
        let dc_id = id.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let tx = dc_tx.clone();
            let id = dc_id.clone();
            Box::pin(async move {
                debug!("incoming data channel '{}' for {id}", channel.label());
                wire_data_channel(&channel, id, tx);
            })
        }));

        let negotiation_tx = events.clone();
        let negotiation_id = id.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = negotiation_tx.clone();
            let id = negotiation_id.clone();
            Box::pin(async move {
                let _ = tx.send((id, EngineEvent::NegotiationNeeded));
            })
        }));

        Ok(Self {
            id,
            pc,
            data_channel: None,
            senders: Vec::new(),
            events,
            closed: false,
        })
    }

    fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, EngineError> {
        match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        }
        .map_err(engine_err)
    }
}

fn engine_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Failed(err.to_string())
}

fn wire_data_channel(
    channel: &Arc<RTCDataChannel>,
    id: ConnectionId,
    events: mpsc::UnboundedSender<(ConnectionId, EngineEvent)>,
) {
    let open_tx = events.clone();
    let open_id = id.clone();
    channel.on_open(Box::new(move || {
        let tx = open_tx.clone();
        let id = open_id.clone();
        Box::pin(async move {
            info!("data channel open for {id}");
            let _ = tx.send((id, EngineEvent::DataChannelOpen));
        })
    }));

    let msg_id = id;
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = events.clone();
        let id = msg_id.clone();
        Box::pin(async move {
            let _ = tx.send((id, EngineEvent::DataReceived(Bytes::from(msg.data.to_vec()))));
        })
    }));
}

#[async_trait]
impl SessionEngine for RtcEngine {
    async fn create_offer(
        &mut self,
        options: &OfferOptions,
    ) -> Result<SessionDescription, EngineError> {
        let rtc_options = options.ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self.pc.create_offer(rtc_options).await.map_err(engine_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError> {
        let desc = Self::to_rtc_description(&desc)?;
        self.pc.set_local_description(desc).await.map_err(engine_err)
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError> {
        let desc = Self::to_rtc_description(&desc)?;
        self.pc.set_remote_description(desc).await.map_err(engine_err)
    }

    async fn add_ice_candidate(
        &mut self,
        candidate: IceCandidateInit,
    ) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await
            .map_err(engine_err)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn create_data_channel(
        &mut self,
        label: &str,
        config: &DataChannelConfig,
    ) -> Result<(), EngineError> {
        let init = RTCDataChannelInit {
            ordered: Some(config.ordered),
            max_retransmits: config.max_retransmits,
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(engine_err)?;
        wire_data_channel(&channel, self.id.clone(), self.events.clone());
        self.data_channel = Some(channel);
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> Result<(), EngineError> {
        let Some(channel) = &self.data_channel else {
            return Err(EngineError::ChannelClosed);
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(EngineError::ChannelClosed);
        }
        if channel.buffered_amount().await > BUFFERED_AMOUNT_CEILING {
            return Err(EngineError::ChannelBusy);
        }
        channel.send(&data).await.map_err(engine_err)?;
        Ok(())
    }

    async fn add_stream(&mut self, stream: &MediaStream) -> Result<(), EngineError> {
        for track in stream.tracks() {
            let sender = self.pc.add_track(track.clone()).await.map_err(engine_err)?;
            self.senders.push(sender);
        }
        Ok(())
    }

    async fn remove_stream(&mut self, _stream: &MediaStream) -> Result<(), EngineError> {
        for sender in self.senders.drain(..) {
            self.pc.remove_track(&sender).await.map_err(engine_err)?;
        }
        Ok(())
    }

    async fn replace_track(&mut self, stream: &MediaStream) -> Result<bool, EngineError> {
        if self.senders.is_empty() || self.senders.len() != stream.tracks().len() {
            return Ok(false);
        }
        for (sender, track) in self.senders.iter().zip(stream.tracks()) {
            sender
                .replace_track(Some(track.clone()))
                .await
                .map_err(engine_err)?;
        }
        Ok(true)
    }

    async fn receive_media(&mut self) -> Result<(), EngineError> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await
                .map_err(engine_err)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.pc.close().await {
            warn!("error closing peer connection {}: {e}", self.id);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RtcEngineFactory;

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create(
        &self,
        id: ConnectionId,
        config: EngineConfig,
        events: mpsc::UnboundedSender<(ConnectionId, EngineEvent)>,
    ) -> Result<Box<dyn SessionEngine>, EngineError> {
        Ok(Box::new(RtcEngine::new(id, config, events).await?))
    }
}
