//! In-process transport.
//!
//! Sessions opened on the same [`LoopbackNetwork`] find each other through
//! the endpoint token carried in their descriptions. Two sessions link once
//! both are stable and each has applied the other's description; from then
//! on data channel messages are delivered in order through the remote
//! session's event channel. Used by the test suites and `tether demo`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use tether_config::SessionConfig;
use tether_core::{
    ConnectionState, IceConnectionState, IceGatheringState, MediaStream, MediaTrack, Result,
    SdpType, SenderId, SessionDescription, SignalingState, StreamId, TetherError, TrackId,
    TrackKind,
};

use crate::session::{
    ChannelReadyState, DataChannel, Session, SessionEvent, SessionEventSender, SessionProvider,
};

#[derive(Default)]
struct Network {
    endpoints: Mutex<HashMap<String, Weak<LoopbackSession>>>,
    link_lock: Mutex<()>,
    next_sender: AtomicU64,
    offers: AtomicU64,
}

impl Network {
    fn endpoint(&self, token: &str) -> Option<Arc<LoopbackSession>> {
        self.endpoints.lock().get(token).and_then(Weak::upgrade)
    }
}

/// A shared in-process network. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Network>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions that are open and not yet closed.
    pub fn session_count(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .values()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    /// Offers created by every session on this network so far.
    pub fn offers_created(&self) -> u64 {
        self.inner.offers.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionProvider for LoopbackNetwork {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn open(
        &self,
        _config: &SessionConfig,
        events: SessionEventSender,
    ) -> Result<Arc<dyn Session>> {
        let endpoint = uuid::Uuid::new_v4().to_string();
        let session = Arc::new_cyclic(|this| LoopbackSession {
            endpoint: endpoint.clone(),
            this: this.clone(),
            network: Arc::downgrade(&self.inner),
            state: Mutex::new(State::default()),
            events: Mutex::new(Some(events)),
        });
        self.inner
            .endpoints
            .lock()
            .insert(endpoint.clone(), Arc::downgrade(&session));
        trace!(%endpoint, "loopback session opened");
        Ok(session)
    }
}

// ── Wire format ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackSdp {
    endpoint: String,
    tracks: Vec<TrackEntry>,
    #[serde(default)]
    candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrackEntry {
    track: TrackId,
    stream: StreamId,
    kind: TrackKind,
    label: String,
}

// ── Session ────────────────────────────────────────────────────

struct State {
    connection: ConnectionState,
    signaling: SignalingState,
    ice_gathering: IceGatheringState,
    ice_connection: IceConnectionState,
    local: Option<SessionDescription>,
    remote_endpoint: Option<String>,
    channels: HashMap<String, Arc<LoopbackChannel>>,
    senders: BTreeMap<SenderId, (Arc<MediaTrack>, StreamId)>,
    remote_tracks: HashMap<TrackId, StreamId>,
    linked: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            connection: ConnectionState::New,
            signaling: SignalingState::Stable,
            ice_gathering: IceGatheringState::New,
            ice_connection: IceConnectionState::New,
            local: None,
            remote_endpoint: None,
            channels: HashMap::new(),
            senders: BTreeMap::new(),
            remote_tracks: HashMap::new(),
            linked: false,
        }
    }
}

pub struct LoopbackSession {
    endpoint: String,
    this: Weak<LoopbackSession>,
    network: Weak<Network>,
    state: Mutex<State>,
    events: Mutex<Option<SessionEventSender>>,
}

impl LoopbackSession {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn encode(&self, state: &State, sdp_type: SdpType) -> Result<SessionDescription> {
        let tracks = state
            .senders
            .values()
            .map(|(track, stream)| TrackEntry {
                track: track.id().clone(),
                stream: stream.clone(),
                kind: track.kind(),
                label: track.label().to_string(),
            })
            .collect();
        let candidates = if state.ice_gathering == IceGatheringState::Complete {
            vec![format!("candidate:loopback {}", self.endpoint)]
        } else {
            Vec::new()
        };
        let sdp = serde_json::to_string(&LoopbackSdp {
            endpoint: self.endpoint.clone(),
            tracks,
            candidates,
        })?;
        Ok(SessionDescription { sdp_type, sdp })
    }

    fn start_gathering(&self) {
        self.emit(SessionEvent::IceGatheringStateChange(
            IceGatheringState::Gathering,
        ));
        self.emit(SessionEvent::IceCandidate {
            candidate: Some(format!("candidate:loopback {}", self.endpoint)),
        });
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if let Some(session) = this.upgrade() {
                session.finish_gathering();
            }
        });
    }

    fn finish_gathering(&self) {
        {
            let mut state = self.state.lock();
            if state.ice_gathering != IceGatheringState::Gathering {
                return;
            }
            state.ice_gathering = IceGatheringState::Complete;
            if let Some(sdp_type) = state.local.as_ref().map(|d| d.sdp_type) {
                if let Ok(local) = self.encode(&state, sdp_type) {
                    state.local = Some(local);
                }
            }
        }
        self.emit(SessionEvent::IceCandidate { candidate: None });
        self.emit(SessionEvent::IceGatheringStateChange(
            IceGatheringState::Complete,
        ));
    }

    /// Diff the remote track list against what was seen before and report
    /// arrivals and removals.
    fn apply_remote_tracks(&self, state: &mut State, tracks: Vec<TrackEntry>) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        let incoming: HashMap<TrackId, StreamId> = tracks
            .iter()
            .map(|t| (t.track.clone(), t.stream.clone()))
            .collect();
        for (track_id, stream_id) in &state.remote_tracks {
            if !incoming.contains_key(track_id) {
                events.push(SessionEvent::TrackRemoved {
                    stream_id: stream_id.clone(),
                    track_id: track_id.clone(),
                });
            }
        }

        let mut by_stream: BTreeMap<StreamId, Vec<TrackEntry>> = BTreeMap::new();
        for entry in tracks {
            by_stream.entry(entry.stream.clone()).or_default().push(entry);
        }
        for (stream_id, entries) in by_stream {
            let handles: Vec<Arc<MediaTrack>> = entries
                .iter()
                .map(|e| Arc::new(MediaTrack::with_id(e.track.clone(), e.kind, e.label.clone())))
                .collect();
            let stream = MediaStream::with_id(stream_id, handles.clone());
            for track in handles {
                if !state.remote_tracks.contains_key(track.id()) {
                    events.push(SessionEvent::Track {
                        track,
                        streams: vec![stream.clone()],
                    });
                }
            }
        }

        state.remote_tracks = incoming;
        events
    }

    fn try_link(&self) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let _guard = network.link_lock.lock();

        let remote_endpoint = {
            let state = self.state.lock();
            let ready = state.signaling == SignalingState::Stable
                && !state.linked
                && state.connection == ConnectionState::New;
            if !ready {
                return;
            }
            state.remote_endpoint.clone()
        };
        let Some(remote) = remote_endpoint.and_then(|e| network.endpoint(&e)) else {
            return;
        };
        let remote_ready = {
            let state = remote.state.lock();
            state.signaling == SignalingState::Stable
                && !state.linked
                && state.connection == ConnectionState::New
                && state.remote_endpoint.as_deref() == Some(self.endpoint.as_str())
        };
        if !remote_ready {
            return;
        }

        debug!(local = %self.endpoint, remote = %remote.endpoint, "loopback sessions linked");
        self.connect();
        remote.connect();
        self.open_channels(&remote);
        remote.open_channels(self);
    }

    fn connect(&self) {
        {
            let mut state = self.state.lock();
            state.linked = true;
            state.connection = ConnectionState::Connecting;
            state.ice_connection = IceConnectionState::Checking;
        }
        self.emit(SessionEvent::IceConnectionStateChange(
            IceConnectionState::Checking,
        ));
        self.emit(SessionEvent::ConnectionStateChange(
            ConnectionState::Connecting,
        ));
        {
            let mut state = self.state.lock();
            state.connection = ConnectionState::Connected;
            state.ice_connection = IceConnectionState::Connected;
        }
        self.emit(SessionEvent::IceConnectionStateChange(
            IceConnectionState::Connected,
        ));
        self.emit(SessionEvent::ConnectionStateChange(
            ConnectionState::Connected,
        ));
    }

    fn open_channels(&self, remote: &LoopbackSession) {
        let channels: Vec<Arc<LoopbackChannel>> =
            self.state.lock().channels.values().cloned().collect();
        for channel in channels {
            channel.set_ready_state(ChannelReadyState::Open);
            remote.emit(SessionEvent::DataChannel {
                label: channel.label.clone(),
            });
            self.emit(SessionEvent::ChannelOpen {
                label: channel.label.clone(),
            });
        }
    }

    fn linked_remote(&self) -> Option<Arc<LoopbackSession>> {
        let endpoint = {
            let state = self.state.lock();
            if !state.linked {
                return None;
            }
            state.remote_endpoint.clone()?
        };
        self.network.upgrade()?.endpoint(&endpoint)
    }

    fn deliver(&self, label: &str, payload: String) -> Result<()> {
        let remote = self
            .linked_remote()
            .ok_or_else(|| TetherError::Transport("loopback remote is gone".into()))?;
        remote.emit(SessionEvent::ChannelMessage {
            label: label.to_string(),
            payload,
        });
        Ok(())
    }

    fn on_remote_closed(&self) {
        let channels: Vec<Arc<LoopbackChannel>> = {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Closed {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.ice_connection = IceConnectionState::Disconnected;
            state.channels.values().cloned().collect()
        };
        for channel in channels {
            channel.set_ready_state(ChannelReadyState::Closed);
            self.emit(SessionEvent::ChannelClose {
                label: channel.label.clone(),
            });
        }
        self.emit(SessionEvent::IceConnectionStateChange(
            IceConnectionState::Disconnected,
        ));
        self.emit(SessionEvent::ConnectionStateChange(
            ConnectionState::Disconnected,
        ));
    }
}

#[async_trait]
impl Session for LoopbackSession {
    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.state.lock().ice_gathering
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice_connection
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn create_local_description(&self, sdp_type: SdpType) -> Result<SessionDescription> {
        let (description, gather) = {
            let mut state = self.state.lock();
            let next = match (sdp_type, state.signaling) {
                (_, SignalingState::Closed) => return Err(TetherError::SessionClosed),
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (SdpType::Offer, _) => {
                    return Err(TetherError::InvalidDescriptionType {
                        expected: SdpType::Answer.to_string(),
                        actual: SdpType::Offer.to_string(),
                    });
                }
                (other, _) => {
                    return Err(TetherError::InvalidDescriptionType {
                        expected: SdpType::Offer.to_string(),
                        actual: other.to_string(),
                    });
                }
            };
            let description = self.encode(&state, sdp_type)?;
            state.local = Some(description.clone());
            state.signaling = next;
            if sdp_type == SdpType::Offer {
                if let Some(network) = self.network.upgrade() {
                    network.offers.fetch_add(1, Ordering::Relaxed);
                }
            }
            let gather = state.ice_gathering == IceGatheringState::New;
            if gather {
                state.ice_gathering = IceGatheringState::Gathering;
            }
            (description, gather)
        };

        if gather {
            self.start_gathering();
        }
        if sdp_type == SdpType::Answer {
            self.try_link();
        }
        Ok(description)
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote: LoopbackSdp = serde_json::from_str(&description.sdp).map_err(|e| {
            TetherError::Transport(format!("malformed loopback description: {e}"))
        })?;

        let events = {
            let mut state = self.state.lock();
            match (description.sdp_type, state.signaling) {
                (_, SignalingState::Closed) => return Err(TetherError::SessionClosed),
                (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                    debug!(endpoint = %self.endpoint, "rolling back local offer");
                    state.local = None;
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Offer, _) => state.signaling = SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                }
                (other, _) => {
                    return Err(TetherError::InvalidDescriptionType {
                        expected: SdpType::Offer.to_string(),
                        actual: other.to_string(),
                    });
                }
            }
            state.remote_endpoint = Some(remote.endpoint);
            self.apply_remote_tracks(&mut state, remote.tracks)
        };

        for event in events {
            self.emit(event);
        }
        if description.sdp_type == SdpType::Answer {
            self.try_link();
        }
        Ok(())
    }

    async fn add_track(&self, track: Arc<MediaTrack>, stream: &MediaStream) -> Result<SenderId> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| TetherError::Transport("loopback network dropped".into()))?;
        let sender = SenderId(network.next_sender.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Closed {
                return Err(TetherError::SessionClosed);
            }
            state.senders.insert(sender, (track, stream.id().clone()));
        }
        self.emit(SessionEvent::NegotiationNeeded);
        Ok(sender)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let removed = self.state.lock().senders.remove(&sender).is_some();
        if removed {
            self.emit(SessionEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = Arc::new(LoopbackChannel {
            label: label.to_string(),
            state: Mutex::new(ChannelReadyState::Connecting),
            owner: self.this.clone(),
        });
        let (linked, first) = {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Closed {
                return Err(TetherError::SessionClosed);
            }
            if state.channels.contains_key(label) {
                return Err(TetherError::Transport(format!(
                    "data channel '{label}' already exists"
                )));
            }
            state.channels.insert(label.to_string(), Arc::clone(&channel));
            (state.linked, state.channels.len() == 1)
        };

        if linked {
            if let Some(remote) = self.linked_remote() {
                channel.set_ready_state(ChannelReadyState::Open);
                remote.emit(SessionEvent::DataChannel {
                    label: label.to_string(),
                });
                self.emit(SessionEvent::ChannelOpen {
                    label: label.to_string(),
                });
            }
        } else if first {
            self.emit(SessionEvent::NegotiationNeeded);
        }
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        let remote = {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Closed {
                return Ok(());
            }
            let was_linked = state.linked;
            state.connection = ConnectionState::Closed;
            state.signaling = SignalingState::Closed;
            state.ice_connection = IceConnectionState::Closed;
            for channel in state.channels.values() {
                channel.set_ready_state(ChannelReadyState::Closed);
            }
            state.senders.clear();
            if was_linked {
                state.remote_endpoint.clone()
            } else {
                None
            }
        };

        self.events.lock().take();
        if let Some(network) = self.network.upgrade() {
            network.endpoints.lock().remove(&self.endpoint);
            if let Some(remote) = remote.and_then(|e| network.endpoint(&e)) {
                remote.on_remote_closed();
            }
        }
        trace!(endpoint = %self.endpoint, "loopback session closed");
        Ok(())
    }
}

// ── Data channel ───────────────────────────────────────────────

pub struct LoopbackChannel {
    label: String,
    state: Mutex<ChannelReadyState>,
    owner: Weak<LoopbackSession>,
}

impl LoopbackChannel {
    fn set_ready_state(&self, state: ChannelReadyState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelReadyState {
        *self.state.lock()
    }

    async fn send_text(&self, payload: String) -> Result<()> {
        if !self.is_open() {
            return Err(TetherError::Transport(format!(
                "data channel '{}' is not open",
                self.label
            )));
        }
        let owner = self.owner.upgrade().ok_or(TetherError::SessionClosed)?;
        owner.deliver(&self.label, payload)
    }
}
