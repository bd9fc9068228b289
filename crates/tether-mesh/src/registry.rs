//! The local peer: identity, connection registry and outbound streams.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use tether_config::TetherConfig;
use tether_core::{
    Event, EventBus, MediaStream, PeerId, RemovalReason, Result, SdpType, SignalingState,
    StreamId, TetherError,
};

use crate::channel::ChannelLabel;
use crate::connection::{ConnectionInfo, PeerConnection};
use crate::dispatch;
use crate::media::{MediaSource, MediaSourceKind};
use crate::negotiation::GlareResolver;
use crate::protocol::{DirectDescription, FirstDescription};
use crate::session::SessionProvider;

struct Inner {
    id: PeerId,
    config: Arc<RwLock<TetherConfig>>,
    provider: Arc<dyn SessionProvider>,
    glare: Arc<dyn GlareResolver>,
    media: Option<Arc<dyn MediaSource>>,
    connections: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
    streams: RwLock<HashMap<StreamId, MediaStream>>,
    /// Placeholder key of the outstanding direct offer, if any.
    direct_pending: Mutex<Option<PeerId>>,
    events: EventBus,
}

/// Handle to the local peer. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct LocalPeer {
    inner: Arc<Inner>,
}

/// Non-owning handle held by background tasks.
#[derive(Clone)]
pub(crate) struct WeakLocalPeer(Weak<Inner>);

impl WeakLocalPeer {
    pub fn upgrade(&self) -> Option<LocalPeer> {
        self.0.upgrade().map(|inner| LocalPeer { inner })
    }
}

pub struct LocalPeerBuilder {
    id: Option<PeerId>,
    config: Option<Arc<RwLock<TetherConfig>>>,
    provider: Arc<dyn SessionProvider>,
    glare: Arc<dyn GlareResolver>,
    media: Option<Arc<dyn MediaSource>>,
    events: Option<EventBus>,
}

impl LocalPeerBuilder {
    /// Use a fixed identity instead of a random one.
    pub fn id(mut self, id: impl Into<PeerId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn config(mut self, config: TetherConfig) -> Self {
        self.config = Some(Arc::new(RwLock::new(config)));
        self
    }

    /// Share a config that may be swapped at runtime. New connections pick
    /// up the current values.
    pub fn shared_config(mut self, config: Arc<RwLock<TetherConfig>>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media = Some(source);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> LocalPeer {
        let id = self.id.unwrap_or_else(PeerId::generate);
        info!(peer = %id, provider = self.provider.name(), "local peer created");
        LocalPeer {
            inner: Arc::new(Inner {
                id,
                config: self.config.unwrap_or_default(),
                provider: self.provider,
                glare: self.glare,
                media: self.media,
                connections: RwLock::new(HashMap::new()),
                streams: RwLock::new(HashMap::new()),
                direct_pending: Mutex::new(None),
                events: self.events.unwrap_or_default(),
            }),
        }
    }
}

impl LocalPeer {
    /// Start building a local peer.
    ///
    /// The glare resolver is required: both ends of every connection must
    /// agree on which side refuses a conflicting offer.
    pub fn builder(
        provider: Arc<dyn SessionProvider>,
        glare: Arc<dyn GlareResolver>,
    ) -> LocalPeerBuilder {
        LocalPeerBuilder {
            id: None,
            config: None,
            provider,
            glare,
            media: None,
            events: None,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakLocalPeer {
        WeakLocalPeer(Arc::downgrade(&self.inner))
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> TetherConfig {
        self.inner.config.read().clone()
    }

    pub fn provider_name(&self) -> &str {
        self.inner.provider.name()
    }

    pub fn connection(&self, peer_id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.inner.connections.read().get(peer_id).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.inner.connections.read().values().cloned().collect()
    }

    /// Keys of every registered connection, placeholders included.
    pub fn connection_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.inner.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.connections().iter().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        infos
    }

    /// Identities of connections whose remote identity is known.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.inner
            .connections
            .read()
            .iter()
            .filter(|(_, c)| !c.is_pending())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn streams(&self) -> Vec<MediaStream> {
        self.inner.streams.read().values().cloned().collect()
    }

    // ── Connections ────────────────────────────────────────────

    /// Register a new connection.
    ///
    /// With `None` the connection is keyed by a fresh placeholder until the
    /// remote identity is learned. Returns `None` if the identity is the
    /// local one or is already registered.
    pub async fn add_connection(
        &self,
        identity: Option<PeerId>,
    ) -> Result<Option<Arc<PeerConnection>>> {
        let pending = identity.is_none();
        let key = identity.unwrap_or_else(PeerId::generate);

        if key == self.inner.id {
            warn!(peer = %key, "refusing connection keyed by the local identity");
            return Ok(None);
        }
        if self.inner.connections.read().contains_key(&key) {
            debug!(peer = %key, "connection already registered");
            return Ok(None);
        }

        let (session_config, idle_timeout) = {
            let config = self.inner.config.read();
            (config.session.clone(), config.peer.idle_timeout())
        };
        let (connection, session_events) = PeerConnection::open(
            self.inner.id.clone(),
            key.clone(),
            pending,
            self.inner.provider.as_ref(),
            &session_config,
            self.inner.events.clone(),
        )
        .await?;
        if !pending {
            connection.set_conflict_policy(self.inner.glare.policy(&self.inner.id, &key));
        }

        // Opening the session suspended; someone may have taken the key meanwhile.
        let raced = {
            let mut connections = self.inner.connections.write();
            if connections.contains_key(&key) {
                true
            } else {
                connections.insert(key.clone(), Arc::clone(&connection));
                false
            }
        };
        if raced {
            debug!(peer = %key, "lost registration race, discarding session");
            connection.close().await;
            return Ok(None);
        }

        dispatch::spawn(self.downgrade(), &connection, session_events);
        self.arm_idle_timer(&connection, idle_timeout);

        info!(peer = %key, pending, "connection added");
        self.inner.events.publish(Event::ConnectionAdded {
            peer_id: key,
            pending,
        });
        Ok(Some(connection))
    }

    /// Existing connection for `peer_id`, or a newly registered one.
    pub async fn connection_for(&self, peer_id: &PeerId) -> Result<Arc<PeerConnection>> {
        if peer_id == self.id() {
            return Err(TetherError::IdentityConflict(format!(
                "{peer_id} is the local identity"
            )));
        }
        if let Some(connection) = self.connection(peer_id) {
            return Ok(connection);
        }
        match self.add_connection(Some(peer_id.clone())).await? {
            Some(connection) => Ok(connection),
            None => self
                .connection(peer_id)
                .ok_or_else(|| TetherError::UnknownConnection(peer_id.to_string())),
        }
    }

    /// Remove and tear down a connection. Returns false if it was not
    /// registered.
    pub async fn remove_connection(&self, peer_id: &PeerId) -> bool {
        let removed = self.inner.connections.write().remove(peer_id);
        match removed {
            Some(connection) => {
                self.finish_removal(connection, RemovalReason::Requested).await;
                true
            }
            None => false,
        }
    }

    /// Remove `connection` only if it is still the registered entry under
    /// its current key.
    pub(crate) async fn remove_entry(
        &self,
        connection: &Arc<PeerConnection>,
        reason: RemovalReason,
    ) -> bool {
        let removed = {
            let mut connections = self.inner.connections.write();
            let key = connection.peer_id();
            match connections.get(&key) {
                Some(existing) if Arc::ptr_eq(existing, connection) => connections.remove(&key),
                _ => None,
            }
        };
        match removed {
            Some(connection) => {
                self.finish_removal(connection, reason).await;
                true
            }
            None => false,
        }
    }

    async fn finish_removal(&self, connection: Arc<PeerConnection>, reason: RemovalReason) {
        let peer_id = connection.peer_id();
        connection.close().await;
        info!(peer = %peer_id, ?reason, "connection removed");
        self.inner.events.publish(Event::ConnectionRemoved { peer_id, reason });
    }

    /// Move `connection` to the key `new_id` in one step.
    pub(crate) fn rekey(&self, connection: &Arc<PeerConnection>, new_id: PeerId) -> Result<()> {
        if new_id == self.inner.id {
            return Err(TetherError::IdentityConflict(format!(
                "{new_id} is the local identity"
            )));
        }

        let old_id = {
            let mut connections = self.inner.connections.write();
            let old_id = connection.peer_id();
            if old_id == new_id {
                return Ok(());
            }
            if !connection.is_pending() {
                return Err(TetherError::IdentityConflict(format!(
                    "{old_id} is already identified, refusing to re-key as {new_id}"
                )));
            }
            if connections.contains_key(&new_id) {
                return Err(TetherError::IdentityConflict(format!(
                    "already connected to {new_id}"
                )));
            }
            let registered = connections
                .get(&old_id)
                .is_some_and(|existing| Arc::ptr_eq(existing, connection));
            if !registered {
                return Err(TetherError::UnknownConnection(old_id.to_string()));
            }
            if let Some(entry) = connections.remove(&old_id) {
                entry.set_peer_id(new_id.clone());
                entry.set_conflict_policy(self.inner.glare.policy(&self.inner.id, &new_id));
                connections.insert(new_id.clone(), entry);
            }
            old_id
        };

        info!(from = %old_id, to = %new_id, "connection re-keyed");
        self.inner.events.publish(Event::ConnectionRekeyed {
            from: old_id,
            to: new_id,
        });
        Ok(())
    }

    fn arm_idle_timer(&self, connection: &Arc<PeerConnection>, timeout: Duration) {
        let peer = self.downgrade();
        let weak = Arc::downgrade(connection);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let (Some(peer), Some(connection)) = (peer.upgrade(), weak.upgrade()) else {
                return;
            };
            connection.disarm_idle_timer();
            if connection.has_connected() {
                return;
            }
            info!(peer = %connection.peer_id(), ?timeout, "connection never connected, removing");
            peer.remove_entry(&connection, RemovalReason::IdleTimeout).await;
        })
        .abort_handle();
        connection.arm_idle_timer(handle);
    }

    // ── Relay ──────────────────────────────────────────────────

    /// Forward a raw envelope to the connection keyed by `to`.
    ///
    /// Dropped silently when no such connection exists.
    pub(crate) async fn relay(
        &self,
        label: ChannelLabel,
        from: &PeerId,
        to: &PeerId,
        payload: String,
    ) -> bool {
        let Some(destination) = self.connection(to) else {
            debug!(%from, %to, %label, "no route to relay destination, dropping");
            return false;
        };
        match destination.send_raw(label, payload).await {
            Ok(true) => {
                debug!(%from, %to, %label, "relayed message");
                self.inner.events.publish(Event::MessageRelayed {
                    label: label.to_string(),
                    from: from.clone(),
                    to: to.clone(),
                });
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(%from, %to, %label, error = %e, "relay failed");
                false
            }
        }
    }

    // ── Streams ────────────────────────────────────────────────

    /// Add a stream to the outbound set and attach it to every connected
    /// connection. Returns false if the stream was already present.
    pub async fn add_stream(&self, stream: MediaStream) -> Result<bool> {
        {
            let mut streams = self.inner.streams.write();
            if streams.contains_key(stream.id()) {
                return Ok(false);
            }
            streams.insert(stream.id().clone(), stream.clone());
        }
        info!(stream = %stream.id(), tracks = stream.tracks().len(), "local stream added");
        self.inner.events.publish(Event::LocalStreamAdded {
            stream_id: stream.id().clone(),
        });

        let connected: Vec<_> = self
            .connections()
            .into_iter()
            .filter(|c| c.is_connected())
            .collect();
        let results =
            futures::future::join_all(connected.iter().map(|c| c.add_stream(&stream))).await;
        for (connection, result) in connected.iter().zip(results) {
            if let Err(e) = result {
                warn!(peer = %connection.peer_id(), stream = %stream.id(), error = %e, "failed to attach stream");
            }
        }
        Ok(true)
    }

    /// Remove a stream everywhere and stop its tracks. Returns false if the
    /// stream was not present.
    pub async fn remove_stream(&self, stream_id: &StreamId) -> Result<bool> {
        let removed = self.inner.streams.write().remove(stream_id);
        let Some(stream) = removed else {
            return Ok(false);
        };

        let connections = self.connections();
        let results =
            futures::future::join_all(connections.iter().map(|c| c.remove_stream(stream_id)))
                .await;
        for (connection, result) in connections.iter().zip(results) {
            if let Err(e) = result {
                warn!(peer = %connection.peer_id(), stream = %stream_id, error = %e, "failed to detach stream");
            }
        }

        stream.stop();
        info!(stream = %stream_id, "local stream removed");
        self.inner.events.publish(Event::LocalStreamRemoved {
            stream_id: stream_id.clone(),
        });
        Ok(true)
    }

    /// Enable or disable every track of a local stream without detaching
    /// it (paused playback). Returns false if the stream is unknown.
    pub fn set_stream_enabled(&self, stream_id: &StreamId, enabled: bool) -> bool {
        match self.inner.streams.read().get(stream_id) {
            Some(stream) => {
                stream.set_enabled(enabled);
                debug!(stream = %stream_id, enabled, "stream toggled");
                true
            }
            None => false,
        }
    }

    /// Acquire camera and microphone and add the result as a local stream.
    pub async fn add_user_stream(&self) -> Result<MediaStream> {
        self.acquire_stream(MediaSourceKind::UserMedia).await
    }

    /// Acquire a screen capture and add it as a local stream.
    pub async fn add_display_stream(&self) -> Result<MediaStream> {
        self.acquire_stream(MediaSourceKind::Display).await
    }

    async fn acquire_stream(&self, kind: MediaSourceKind) -> Result<MediaStream> {
        let Some(source) = self.inner.media.as_ref() else {
            return Err(TetherError::MediaUnavailable(format!(
                "no media source configured for {kind}"
            )));
        };
        let stream = match source.acquire(kind).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%kind, error = %e, "failed to acquire media");
                return Err(e);
            }
        };
        self.add_stream(stream.clone()).await?;
        Ok(stream)
    }

    // ── Bootstrap ──────────────────────────────────────────────

    /// Create a pending connection and its offer for out-of-band delivery.
    pub async fn get_first_offer(&self) -> Result<FirstDescription> {
        let connection = self.add_pending_connection().await?;
        let description = match connection.create_offer().await {
            Ok(description) => description,
            Err(e) => {
                self.remove_entry(&connection, RemovalReason::Requested).await;
                return Err(e);
            }
        };
        info!(connection = %connection.peer_id(), "first offer ready");
        Ok(FirstDescription {
            from_id: self.inner.id.clone(),
            connection_id: connection.peer_id(),
            description,
        })
    }

    /// Consume an out-of-band offer or answer.
    ///
    /// An offer yields the answer to send back. An answer re-keys the
    /// pending connection named by `connection_id` under the sender's
    /// identity and yields nothing.
    pub async fn set_first_offer_or_answer(
        &self,
        message: FirstDescription,
    ) -> Result<Option<FirstDescription>> {
        match message.description.sdp_type {
            SdpType::Offer => {
                let connection = self.connection_for(&message.from_id).await?;
                let answer = connection
                    .receive_offer_or_answer(message.description)
                    .await?;
                Ok(answer.map(|description| FirstDescription {
                    from_id: self.inner.id.clone(),
                    connection_id: message.connection_id,
                    description,
                }))
            }
            SdpType::Answer => {
                // Only a placeholder awaiting its first answer may take an identity.
                let connection = self
                    .connection(&message.connection_id)
                    .filter(|c| c.is_pending())
                    .ok_or_else(|| {
                        TetherError::UnknownConnection(message.connection_id.to_string())
                    })?;
                expect_local_offer(&connection)?;
                self.rekey(&connection, message.from_id)?;
                connection
                    .receive_offer_or_answer(message.description)
                    .await?;
                Ok(None)
            }
            other => Err(TetherError::InvalidDescriptionType {
                expected: "offer or answer".into(),
                actual: other.to_string(),
            }),
        }
    }

    /// Start a one-to-one pairing. Replaces any direct offer still
    /// outstanding.
    pub async fn direct_offer(&self) -> Result<DirectDescription> {
        let previous = self.inner.direct_pending.lock().take();
        if let Some(previous) = previous.and_then(|id| self.connection(&id)) {
            if previous.is_pending() {
                self.remove_entry(&previous, RemovalReason::Requested).await;
            }
        }

        let connection = self.add_pending_connection().await?;
        *self.inner.direct_pending.lock() = Some(connection.peer_id());
        let description = connection.create_offer().await?;
        Ok(DirectDescription {
            id: self.inner.id.clone(),
            description,
        })
    }

    /// Consume a one-to-one pairing message. An offer yields the answer.
    pub async fn accept_direct(
        &self,
        message: DirectDescription,
    ) -> Result<Option<DirectDescription>> {
        match message.description.sdp_type {
            SdpType::Offer => {
                let connection = self.connection_for(&message.id).await?;
                let answer = connection
                    .receive_offer_or_answer(message.description)
                    .await?;
                Ok(answer.map(|description| DirectDescription {
                    id: self.inner.id.clone(),
                    description,
                }))
            }
            SdpType::Answer => {
                let placeholder = self.inner.direct_pending.lock().take().ok_or_else(|| {
                    TetherError::UnknownConnection("no direct offer outstanding".into())
                })?;
                let connection = self
                    .connection(&placeholder)
                    .ok_or_else(|| TetherError::UnknownConnection(placeholder.to_string()))?;
                expect_local_offer(&connection)?;
                self.rekey(&connection, message.id)?;
                connection
                    .receive_offer_or_answer(message.description)
                    .await?;
                Ok(None)
            }
            other => Err(TetherError::InvalidDescriptionType {
                expected: "offer or answer".into(),
                actual: other.to_string(),
            }),
        }
    }

    async fn add_pending_connection(&self) -> Result<Arc<PeerConnection>> {
        self.add_connection(None).await?.ok_or_else(|| {
            TetherError::IdentityConflict("generated placeholder is already registered".into())
        })
    }

    /// Remove every connection and stop every local stream.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = self.inner.connections.write().drain().map(|(_, c)| c).collect();
        for connection in connections {
            self.finish_removal(connection, RemovalReason::Requested).await;
        }
        let streams: Vec<_> = self.inner.streams.write().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.stop();
        }
        info!(peer = %self.inner.id, "local peer shut down");
        self.inner.events.publish(Event::Shutdown);
    }
}

impl std::fmt::Debug for LocalPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPeer")
            .field("id", &self.inner.id)
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Check that `connection` has an offer out, before an answer is allowed to
/// change its identity.
fn expect_local_offer(connection: &PeerConnection) -> Result<()> {
    if connection.states().signaling == SignalingState::HaveLocalOffer {
        Ok(())
    } else {
        Err(TetherError::InvalidDescriptionType {
            expected: SdpType::Offer.to_string(),
            actual: SdpType::Answer.to_string(),
        })
    }
}
