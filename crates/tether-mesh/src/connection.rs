//! One negotiated session with one remote peer.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use tether_config::SessionConfig;
use tether_core::{
    ConnectionState, Event, EventBus, MediaStream, MediaTrack, PeerId, Result, SenderId,
    SessionDescription, SessionStates, SignalingState, StreamId, TetherError,
};

use crate::channel::{ChannelLabel, ChannelSet};
use crate::envelope;
use crate::negotiation::{ConflictPolicy, Negotiator, RemoteOutcome};
use crate::session::{Session, SessionEventReceiver, SessionProvider};

enum Attachment {
    /// Waiting for the session to connect.
    Deferred,
    Attaching,
    Attached(Vec<SenderId>),
}

struct Outbound {
    stream: MediaStream,
    attachment: Attachment,
}

/// Serializable snapshot of a connection, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub pending: bool,
    pub states: SessionStates,
    pub outbound_streams: usize,
    pub inbound_streams: usize,
    pub open_channels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A peer connection: a session plus its control channels, stream sets and
/// negotiation state.
///
/// The key starts as a local placeholder when the remote identity is not
/// known yet (`pending`), and is replaced once it is learned.
pub struct PeerConnection {
    key: RwLock<PeerId>,
    pending: AtomicBool,
    local_id: PeerId,
    session: Arc<dyn Session>,
    channels: ChannelSet,
    negotiator: Negotiator,
    outbound: Mutex<HashMap<StreamId, Outbound>>,
    inbound: Mutex<HashMap<StreamId, MediaStream>>,
    idle_timer: Mutex<Option<AbortHandle>>,
    connected_once: AtomicBool,
    /// A renegotiation is scheduled and will pick up every change so far.
    renegotiation_queued: AtomicBool,
    /// Local media changed mid-exchange; re-offer once signaling is stable.
    renegotiation_deferred: AtomicBool,
    created_at: DateTime<Utc>,
    events: EventBus,
}

impl PeerConnection {
    /// Open a session and its control channels.
    ///
    /// The returned receiver carries the session's events and must be
    /// pumped by the owner.
    pub(crate) async fn open(
        local_id: PeerId,
        key: PeerId,
        pending: bool,
        provider: &dyn SessionProvider,
        config: &SessionConfig,
        events: EventBus,
    ) -> Result<(Arc<Self>, SessionEventReceiver)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = provider.open(config, tx).await?;

        let channels = match ChannelSet::create(session.as_ref()).await {
            Ok(channels) => channels,
            Err(e) => {
                let _ = session.close().await;
                return Err(e);
            }
        };

        let negotiator = Negotiator::new(Arc::clone(&session), config.ice_gather_timeout());
        let connection = Arc::new(Self {
            key: RwLock::new(key),
            pending: AtomicBool::new(pending),
            local_id,
            session,
            channels,
            negotiator,
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            idle_timer: Mutex::new(None),
            connected_once: AtomicBool::new(false),
            renegotiation_queued: AtomicBool::new(false),
            renegotiation_deferred: AtomicBool::new(false),
            created_at: Utc::now(),
            events,
        });
        Ok((connection, rx))
    }

    // ── Identity ───────────────────────────────────────────────

    /// The key this connection is registered under.
    pub fn peer_id(&self) -> PeerId {
        self.key.read().clone()
    }

    /// True while the key is a placeholder.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub(crate) fn set_peer_id(&self, id: PeerId) {
        *self.key.write() = id;
        self.pending.store(false, Ordering::Release);
    }

    /// Where messages go when the caller names no recipient. A pending
    /// connection does not know the remote identity, so it sends
    /// unaddressed.
    fn default_recipient(&self) -> Option<PeerId> {
        if self.is_pending() {
            None
        } else {
            Some(self.peer_id())
        }
    }

    // ── State ──────────────────────────────────────────────────

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.connection_state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Whether the session ever reached "connected".
    pub fn has_connected(&self) -> bool {
        self.connected_once.load(Ordering::Acquire)
    }

    /// Current connection, signaling, ICE gathering and ICE connection states.
    pub fn states(&self) -> SessionStates {
        self.session.states()
    }

    pub fn conflict_policy(&self) -> Option<ConflictPolicy> {
        self.negotiator.policy()
    }

    pub(crate) fn set_conflict_policy(&self, policy: ConflictPolicy) {
        self.negotiator.set_policy(policy);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn open_channels(&self) -> Vec<ChannelLabel> {
        self.channels.open_labels()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer_id: self.peer_id(),
            pending: self.is_pending(),
            states: self.states(),
            outbound_streams: self.outbound.lock().len(),
            inbound_streams: self.inbound.lock().len(),
            open_channels: self
                .open_channels()
                .into_iter()
                .map(|l| l.as_str().to_string())
                .collect(),
            created_at: self.created_at,
        }
    }

    pub(crate) fn observe_ice_gathering(&self, state: tether_core::IceGatheringState) {
        self.negotiator.ice().observe(state);
    }

    // ── Idle timer ─────────────────────────────────────────────

    pub(crate) fn arm_idle_timer(&self, handle: AbortHandle) {
        if let Some(previous) = self.idle_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the idle timer. Returns false if it was not armed.
    pub(crate) fn cancel_idle_timer(&self) -> bool {
        match self.idle_timer.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget the timer handle without aborting it; used by the timer task
    /// itself before it tears the connection down.
    pub(crate) fn disarm_idle_timer(&self) {
        self.idle_timer.lock().take();
    }

    pub(crate) fn mark_connected(&self) {
        self.connected_once.store(true, Ordering::Release);
        self.cancel_idle_timer();
    }

    // ── Outbound streams ───────────────────────────────────────

    /// Streams this connection sends, attached or not.
    pub fn outbound_streams(&self) -> Vec<StreamId> {
        self.outbound.lock().keys().cloned().collect()
    }

    /// Whether the stream's tracks are attached to the session.
    pub fn is_sending(&self, stream_id: &StreamId) -> bool {
        self.outbound
            .lock()
            .get(stream_id)
            .is_some_and(|o| matches!(o.attachment, Attachment::Attached(_)))
    }

    /// Add a stream to the outbound set. Idempotent.
    ///
    /// Tracks are attached right away if the session is connected, otherwise
    /// on the transition to connected. Returns false if the stream was
    /// already present.
    pub async fn add_stream(&self, stream: &MediaStream) -> Result<bool> {
        {
            let mut outbound = self.outbound.lock();
            if outbound.contains_key(stream.id()) {
                return Ok(false);
            }
            outbound.insert(
                stream.id().clone(),
                Outbound {
                    stream: stream.clone(),
                    attachment: Attachment::Deferred,
                },
            );
        }

        if self.is_connected() {
            self.attach(stream.id()).await?;
        } else {
            debug!(peer = %self.peer_id(), stream = %stream.id(), "deferring stream until connected");
        }
        Ok(true)
    }

    /// Remove a stream from the outbound set, detaching its tracks.
    /// Returns false if the stream was not present.
    pub async fn remove_stream(&self, stream_id: &StreamId) -> Result<bool> {
        let removed = self.outbound.lock().remove(stream_id);
        let Some(entry) = removed else {
            return Ok(false);
        };
        if let Attachment::Attached(senders) = entry.attachment {
            for sender in senders {
                self.session.remove_track(sender).await?;
            }
        }
        debug!(peer = %self.peer_id(), stream = %stream_id, "removed outbound stream");
        Ok(true)
    }

    /// Merge `streams` into the outbound set and attach everything deferred.
    pub(crate) async fn attach_outbound(&self, streams: Vec<MediaStream>) -> Result<()> {
        let deferred: Vec<StreamId> = {
            let mut outbound = self.outbound.lock();
            for stream in streams {
                outbound
                    .entry(stream.id().clone())
                    .or_insert_with(|| Outbound {
                        stream,
                        attachment: Attachment::Deferred,
                    });
            }
            outbound
                .iter()
                .filter(|(_, o)| matches!(o.attachment, Attachment::Deferred))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for stream_id in deferred {
            self.attach(&stream_id).await?;
        }
        Ok(())
    }

    async fn attach(&self, stream_id: &StreamId) -> Result<()> {
        let stream = {
            let mut outbound = self.outbound.lock();
            match outbound.get_mut(stream_id) {
                Some(entry) if matches!(entry.attachment, Attachment::Deferred) => {
                    entry.attachment = Attachment::Attaching;
                    entry.stream.clone()
                }
                _ => return Ok(()),
            }
        };

        let mut senders = Vec::with_capacity(stream.tracks().len());
        for track in stream.tracks() {
            match self.session.add_track(Arc::clone(track), &stream).await {
                Ok(sender) => senders.push(sender),
                Err(e) => {
                    for sender in senders {
                        let _ = self.session.remove_track(sender).await;
                    }
                    if let Some(entry) = self.outbound.lock().get_mut(stream_id) {
                        entry.attachment = Attachment::Deferred;
                    }
                    return Err(e);
                }
            }
        }

        // The stream may have been removed while the tracks were being added.
        let orphaned = {
            let mut outbound = self.outbound.lock();
            match outbound.get_mut(stream_id) {
                Some(entry) if matches!(entry.attachment, Attachment::Attaching) => {
                    entry.attachment = Attachment::Attached(senders);
                    None
                }
                _ => Some(senders),
            }
        };
        match orphaned {
            Some(senders) => {
                for sender in senders {
                    self.session.remove_track(sender).await?;
                }
            }
            None => {
                info!(peer = %self.peer_id(), stream = %stream_id, "attached outbound stream");
            }
        }
        Ok(())
    }

    // ── Inbound streams ────────────────────────────────────────

    pub fn inbound_streams(&self) -> Vec<MediaStream> {
        self.inbound.lock().values().cloned().collect()
    }

    /// Record a remote track arrival.
    ///
    /// Every track must belong to exactly one stream. Returns the stream if
    /// it was not seen before.
    pub fn on_track(
        &self,
        track: &MediaTrack,
        streams: &[MediaStream],
    ) -> Result<Option<MediaStream>> {
        let [stream] = streams else {
            return Err(TetherError::UnexpectedMultiStreamEvent(streams.len()));
        };
        debug!(peer = %self.peer_id(), track = %track.id(), kind = ?track.kind(), "remote track");

        {
            let mut inbound = self.inbound.lock();
            if inbound.contains_key(stream.id()) {
                return Ok(None);
            }
            inbound.insert(stream.id().clone(), stream.clone());
        }

        self.events.publish(Event::RemoteStreamAdded {
            peer_id: self.peer_id(),
            stream_id: stream.id().clone(),
        });
        Ok(Some(stream.clone()))
    }

    /// Drop a remote stream once the remote withdrew a track from it.
    pub fn on_track_removed(&self, stream_id: &StreamId) -> bool {
        if self.inbound.lock().remove(stream_id).is_none() {
            return false;
        }
        self.events.publish(Event::RemoteStreamRemoved {
            peer_id: self.peer_id(),
            stream_id: stream_id.clone(),
        });
        true
    }

    // ── Messaging ──────────────────────────────────────────────

    /// Send `body` on a control channel, wrapped in an envelope from the
    /// local peer to `to` (default: this connection's remote).
    ///
    /// Returns false when the channel is not open; nothing is queued.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        label: ChannelLabel,
        body: &T,
        to: Option<PeerId>,
    ) -> Result<bool> {
        let body = serde_json::to_value(body)?;
        let to = to.or_else(|| self.default_recipient());
        let payload = envelope::wrap(body, &self.local_id, to.as_ref());
        self.send_raw(label, payload.to_string()).await
    }

    /// Send an already-serialized payload unchanged.
    pub(crate) async fn send_raw(&self, label: ChannelLabel, payload: String) -> Result<bool> {
        let channel = self.channels.get(label)?;
        if !channel.is_open() {
            debug!(peer = %self.peer_id(), %label, state = %channel.ready_state(), "channel not open, dropping message");
            return Ok(false);
        }
        channel.send_text(payload).await?;
        Ok(true)
    }

    // ── Negotiation ────────────────────────────────────────────

    /// Create and apply an offer, send it on the description channel, and
    /// return the local description once ICE gathering completes.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.negotiator.begin_offer().await?;
        debug!(peer = %self.peer_id(), "created offer");
        self.send(ChannelLabel::Description, &offer, None).await?;
        self.negotiator.gathered_local_description().await
    }

    /// Apply a remote offer or answer.
    ///
    /// For an offer, returns the gathered answer (also sent on the
    /// description channel), or `None` if the offer was refused because of
    /// glare. For an answer, returns `None`.
    pub async fn receive_offer_or_answer(
        &self,
        description: SessionDescription,
    ) -> Result<Option<SessionDescription>> {
        let kind = description.sdp_type;
        match self.negotiator.apply_remote(description).await? {
            RemoteOutcome::Refused => {
                info!(peer = %self.peer_id(), "offer refused, own offer outstanding");
                Ok(None)
            }
            RemoteOutcome::Settled => {
                debug!(peer = %self.peer_id(), %kind, "applied remote description");
                self.resume_deferred_renegotiation().await?;
                Ok(None)
            }
            RemoteOutcome::AnswerRequired => {
                let answer = self.negotiator.begin_answer().await?;
                debug!(peer = %self.peer_id(), "created answer");
                self.send(ChannelLabel::Description, &answer, None).await?;
                let answer = self.negotiator.gathered_local_description().await?;
                self.resume_deferred_renegotiation().await?;
                Ok(Some(answer))
            }
        }
    }

    /// Start a fresh offer after local media changed. Skipped while the
    /// session has never left "new"; the first offer is driven explicitly.
    ///
    /// Calls arriving while one is already queued are folded into it. A
    /// call arriving mid-exchange is deferred until signaling is stable.
    pub async fn renegotiate(&self) -> Result<()> {
        if self.connection_state() == ConnectionState::New {
            return Ok(());
        }
        if self.renegotiation_queued.swap(true, Ordering::AcqRel) {
            trace!(peer = %self.peer_id(), "renegotiation already queued");
            return Ok(());
        }
        // Let the rest of a burst of track changes land first.
        tokio::task::yield_now().await;
        self.renegotiation_queued.store(false, Ordering::Release);

        if self.session.signaling_state() != SignalingState::Stable {
            debug!(peer = %self.peer_id(), "negotiation needed mid-exchange, deferring");
            self.renegotiation_deferred.store(true, Ordering::Release);
            return Ok(());
        }
        debug!(peer = %self.peer_id(), "negotiation needed, re-offering");
        self.create_offer().await.map(|_| ())
    }

    async fn resume_deferred_renegotiation(&self) -> Result<()> {
        if self.renegotiation_deferred.swap(false, Ordering::AcqRel) {
            self.renegotiate().await?;
        }
        Ok(())
    }

    // ── Teardown ───────────────────────────────────────────────

    /// Detach every outbound track and close the session.
    pub(crate) async fn close(&self) {
        self.cancel_idle_timer();
        self.negotiator.ice().close();

        let senders: Vec<SenderId> = self
            .outbound
            .lock()
            .drain()
            .filter_map(|(_, o)| match o.attachment {
                Attachment::Attached(senders) => Some(senders),
                _ => None,
            })
            .flatten()
            .collect();
        for sender in senders {
            if let Err(e) = self.session.remove_track(sender).await {
                debug!(error = %e, "failed to detach track during close");
            }
        }
        self.inbound.lock().clear();

        if let Err(e) = self.session.close().await {
            warn!(peer = %self.peer_id(), error = %e, "session close failed");
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id())
            .field("pending", &self.is_pending())
            .field("state", &self.connection_state())
            .finish()
    }
}
