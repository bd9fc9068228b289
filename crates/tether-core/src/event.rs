use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{ConnectionState, PeerId, StreamId};

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Explicit `remove_connection` call.
    Requested,
    /// Never reached "connected" before the idle timeout.
    IdleTimeout,
    /// The session reported failed, disconnected or closed.
    SessionTerminated,
    /// The remote announced an identity that is already taken.
    IdentityConflict,
    /// The transport broke the track-arrival contract.
    ContractViolation,
}

/// Lifecycle events published by the local peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Connection lifecycle ───────────────────────────────────
    ConnectionAdded {
        peer_id: PeerId,
        pending: bool,
    },
    ConnectionRekeyed {
        from: PeerId,
        to: PeerId,
    },
    ConnectionStateChanged {
        peer_id: PeerId,
        state: ConnectionState,
    },
    ConnectionRemoved {
        peer_id: PeerId,
        reason: RemovalReason,
    },

    // ── Stream lifecycle ───────────────────────────────────────
    LocalStreamAdded {
        stream_id: StreamId,
    },
    LocalStreamRemoved {
        stream_id: StreamId,
    },
    RemoteStreamAdded {
        peer_id: PeerId,
        stream_id: StreamId,
    },
    RemoteStreamRemoved {
        peer_id: PeerId,
        stream_id: StreamId,
    },

    // ── Relay ──────────────────────────────────────────────────
    MessageRelayed {
        label: String,
        from: PeerId,
        to: PeerId,
    },

    Shutdown,
}

/// A broadcast-based event bus for front-ends that render mesh state.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
