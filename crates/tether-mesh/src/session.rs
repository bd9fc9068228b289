//! The transport seam.
//!
//! A [`Session`] is one real-time session with exactly one remote endpoint.
//! The mesh never talks to a network stack directly: everything it needs
//! (descriptions, ICE progress, tracks, data channels) goes through these
//! traits, and everything the session observes comes back as a
//! [`SessionEvent`] on the channel handed to [`SessionProvider::open`].

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use tether_config::SessionConfig;
use tether_core::{
    ConnectionState, IceConnectionState, IceGatheringState, MediaStream, MediaTrack, Result,
    SdpType, SenderId, SessionDescription, SessionStates, SignalingState, StreamId, TrackId,
};

/// Ready state of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelReadyState::Connecting => "connecting",
            ChannelReadyState::Open => "open",
            ChannelReadyState::Closing => "closing",
            ChannelReadyState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Everything a session reports back to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A remote track arrived, together with the streams it belongs to.
    Track {
        track: Arc<MediaTrack>,
        streams: Vec<MediaStream>,
    },
    /// A remote track was withdrawn from a stream.
    TrackRemoved { stream_id: StreamId, track_id: TrackId },
    /// The remote side created a data channel.
    DataChannel { label: String },
    /// A locally created data channel became writable.
    ChannelOpen { label: String },
    /// A text message arrived on the data channel with this label.
    ChannelMessage { label: String, payload: String },
    ChannelClose { label: String },
    /// Local media changed in a way the remote has not seen yet.
    NegotiationNeeded,
    /// A local ICE candidate; `None` marks the end of candidates.
    IceCandidate { candidate: Option<String> },
    ConnectionStateChange(ConnectionState),
    IceGatheringStateChange(IceGatheringState),
    IceConnectionStateChange(IceConnectionState),
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// A bidirectional text channel multiplexed over a session.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelReadyState;

    fn is_open(&self) -> bool {
        self.ready_state() == ChannelReadyState::Open
    }

    async fn send_text(&self, payload: String) -> Result<()>;
}

/// One transport session with a single remote endpoint.
#[async_trait]
pub trait Session: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    fn signaling_state(&self) -> SignalingState;

    fn ice_gathering_state(&self) -> IceGatheringState;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn states(&self) -> SessionStates {
        SessionStates {
            connection: self.connection_state(),
            signaling: self.signaling_state(),
            ice_gathering: self.ice_gathering_state(),
            ice_connection: self.ice_connection_state(),
        }
    }

    /// The currently applied local description, including any candidates
    /// gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Create a description of the given type and apply it locally.
    async fn create_local_description(&self, sdp_type: SdpType) -> Result<SessionDescription>;

    /// Apply a description received from the remote endpoint.
    ///
    /// An offer that arrives while a local offer is outstanding rolls the
    /// local offer back.
    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_track(&self, track: Arc<MediaTrack>, stream: &MediaStream) -> Result<SenderId>;

    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Opens sessions. One provider serves every connection of a local peer.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Provider name, for logs and `doctor` output.
    fn name(&self) -> &str;

    async fn open(
        &self,
        config: &SessionConfig,
        events: SessionEventSender,
    ) -> Result<Arc<dyn Session>>;
}
