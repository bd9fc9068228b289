//! # tether-mesh
//!
//! Serverless full-mesh negotiation between peers.
//!
//! A [`LocalPeer`] keeps one [`PeerConnection`] per remote identity. The
//! first connection is bootstrapped by carrying an offer and an answer
//! out-of-band; after that, every connection exchanges descriptions over
//! its own `sdp` data channel, and peers relay addressed messages so that
//! two peers with a common neighbour can negotiate a direct link without
//! any server.
//!
//! The transport is pluggable through [`SessionProvider`]. The crate ships
//! an in-process [`LoopbackNetwork`] and, behind the `webrtc` feature, a
//! provider built on webrtc-rs.

pub mod channel;
pub mod connection;
mod discovery;
mod dispatch;
pub mod envelope;
pub mod loopback;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod session;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use channel::ChannelLabel;
pub use connection::{ConnectionInfo, PeerConnection};
pub use envelope::{Envelope, Route};
pub use loopback::LoopbackNetwork;
pub use media::{MediaSource, MediaSourceKind, SyntheticMediaSource};
pub use negotiation::{ConflictPolicy, GlareResolver};
pub use protocol::{DirectDescription, FirstDescription, PeerAnnouncement};
pub use registry::{LocalPeer, LocalPeerBuilder};
pub use session::{
    ChannelReadyState, DataChannel, Session, SessionEvent, SessionEventSender, SessionProvider,
};
#[cfg(feature = "webrtc")]
pub use crate::webrtc::WebRtcProvider;
