//! Transport backed by webrtc-rs.
//!
//! Outbound tracks are registered as sample tracks; feeding samples is the
//! capture layer's job. webrtc-rs has no per-track removal callback, so
//! remote streams leave only with their connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use tether_config::SessionConfig;
use tether_core::{
    ConnectionState, IceConnectionState, IceGatheringState, MediaStream, MediaTrack, Result,
    SdpType, SenderId, SessionDescription, SignalingState, StreamId, TetherError, TrackId,
    TrackKind,
};

use crate::session::{
    ChannelReadyState, DataChannel, Session, SessionEvent, SessionEventSender, SessionProvider,
};

fn transport(e: webrtc::Error) -> TetherError {
    TetherError::Other(anyhow::Error::new(e).context("webrtc"))
}

/// Opens one `RTCPeerConnection` per session.
#[derive(Debug, Clone, Default)]
pub struct WebRtcProvider;

#[async_trait]
impl SessionProvider for WebRtcProvider {
    fn name(&self) -> &str {
        "webrtc"
    }

    async fn open(
        &self,
        config: &SessionConfig,
        events: SessionEventSender,
    ) -> Result<Arc<dyn Session>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(transport)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media).map_err(transport)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(transport)?);
        register_handlers(&pc, events.clone());

        Ok(Arc::new(WebRtcSession {
            pc,
            events,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(0),
        }))
    }
}

fn register_handlers(pc: &RTCPeerConnection, events: SessionEventSender) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = tx.send(SessionEvent::ConnectionStateChange(connection_state(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let _ = tx.send(SessionEvent::IceConnectionStateChange(
            ice_connection_state(state),
        ));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let state = match state {
            RTCIceGathererState::Gathering => IceGatheringState::Gathering,
            RTCIceGathererState::Complete | RTCIceGathererState::Closed => {
                IceGatheringState::Complete
            }
            _ => IceGatheringState::New,
        };
        let _ = tx.send(SessionEvent::IceGatheringStateChange(state));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidate = candidate
            .and_then(|c| c.to_json().ok())
            .map(|init| init.candidate);
        let _ = tx.send(SessionEvent::IceCandidate { candidate });
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let _ = tx.send(SessionEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let handle = Arc::new(MediaTrack::with_id(
                TrackId::new(track.id()),
                kind,
                track.id(),
            ));
            let stream =
                MediaStream::with_id(StreamId::new(track.stream_id()), vec![Arc::clone(&handle)]);
            let _ = tx.send(SessionEvent::Track {
                track: handle,
                streams: vec![stream],
            });
            Box::pin(async {})
        },
    ));

    // Remote-created channels carry the remote's messages.
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let label = dc.label().to_string();
        let _ = events.send(SessionEvent::DataChannel {
            label: label.clone(),
        });
        let tx = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(payload) => {
                    let _ = tx.send(SessionEvent::ChannelMessage {
                        label: label.clone(),
                        payload,
                    });
                }
                Err(_) => debug!(%label, "dropping binary data channel message"),
            }
            Box::pin(async {})
        }));
        Box::pin(async {})
    }));
}

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    events: SessionEventSender,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

#[async_trait]
impl Session for WebRtcSession {
    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        match self.pc.ice_gathering_state() {
            RTCIceGatheringState::Gathering => IceGatheringState::Gathering,
            RTCIceGatheringState::Complete => IceGatheringState::Complete,
            _ => IceGatheringState::New,
        }
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        ice_connection_state(self.pc.ice_connection_state())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(|d| from_rtc(d).ok())
    }

    async fn create_local_description(&self, sdp_type: SdpType) -> Result<SessionDescription> {
        let description = match sdp_type {
            SdpType::Offer => self.pc.create_offer(None).await,
            SdpType::Answer => self.pc.create_answer(None).await,
            other => {
                return Err(TetherError::InvalidDescriptionType {
                    expected: "offer or answer".into(),
                    actual: other.to_string(),
                });
            }
        }
        .map_err(transport)?;
        self.pc
            .set_local_description(description.clone())
            .await
            .map_err(transport)?;
        from_rtc(description)
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        if description.is_offer() && self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            debug!("rolling back local offer");
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc
                .set_local_description(rollback)
                .await
                .map_err(transport)?;
        }
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(transport)
    }

    async fn add_track(&self, track: Arc<MediaTrack>, stream: &MediaStream) -> Result<SenderId> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_string(),
            stream.id().to_string(),
        ));
        let sender = self
            .pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(transport)?;
        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().insert(id, sender);
        Ok(id)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let removed = self.senders.lock().remove(&sender);
        if let Some(sender) = removed {
            self.pc.remove_track(&sender).await.map_err(transport)?;
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(transport)?;

        let tx = self.events.clone();
        let open_label = label.to_string();
        dc.on_open(Box::new(move || {
            let _ = tx.send(SessionEvent::ChannelOpen {
                label: open_label.clone(),
            });
            Box::pin(async {})
        }));
        let tx = self.events.clone();
        let close_label = label.to_string();
        dc.on_close(Box::new(move || {
            let _ = tx.send(SessionEvent::ChannelClose {
                label: close_label.clone(),
            });
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcChannel { dc }))
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(transport)
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn ready_state(&self) -> ChannelReadyState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelReadyState::Open,
            RTCDataChannelState::Closing => ChannelReadyState::Closing,
            RTCDataChannelState::Closed => ChannelReadyState::Closed,
            _ => ChannelReadyState::Connecting,
        }
    }

    async fn send_text(&self, payload: String) -> Result<()> {
        self.dc.send_text(payload).await.map_err(transport)?;
        Ok(())
    }
}

// ── Conversions ────────────────────────────────────────────────

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn ice_connection_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TetherError::Transport("description has no type".into()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp).map_err(transport),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp).map_err(transport),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp).map_err(transport),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}
