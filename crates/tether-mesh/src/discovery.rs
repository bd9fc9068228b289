//! Identity exchange and mesh discovery over the `id` control channel.
//!
//! When the channel opens each side sends its identity together with the
//! identities it is connected to. A receiver that sees an identity it has no
//! connection for opens one and sends the offer through the connection that
//! revealed it; the revealing peer relays it on. The answer comes back the
//! same way.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use tether_core::{PeerId, RemovalReason, Result, TetherError};

use crate::channel::ChannelLabel;
use crate::connection::PeerConnection;
use crate::protocol::PeerAnnouncement;
use crate::registry::LocalPeer;

/// Announce ourselves on `connection`.
///
/// The peer list holds only peers we have live sessions with, minus the
/// recipient: half-negotiated connections cannot carry a relayed offer yet.
pub(crate) async fn announce(peer: &LocalPeer, connection: &PeerConnection) -> Result<()> {
    let recipient = connection.peer_id();
    let mut peers: Vec<PeerId> = if peer.config().peer.announce_peers {
        peer.known_peers()
            .into_iter()
            .filter(|id| *id != recipient)
            .filter(|id| peer.connection(id).is_some_and(|c| c.is_connected()))
            .collect()
    } else {
        Vec::new()
    };
    peers.sort();
    let announcement = PeerAnnouncement {
        id: peer.id().clone(),
        peers,
    };
    connection
        .send(ChannelLabel::Identity, &announcement, None)
        .await?;
    Ok(())
}

/// Handle the remote's announcement: settle the connection's identity, then
/// reach out to any peer it revealed that we do not know yet.
pub(crate) async fn on_announcement(
    peer: &LocalPeer,
    connection: &Arc<PeerConnection>,
    announcement: PeerAnnouncement,
) -> Result<()> {
    settle_identity(peer, connection, announcement.id).await?;
    if !peer.config().peer.announce_peers {
        return Ok(());
    }

    let mut seen = HashSet::new();
    let unknown: Vec<PeerId> = announcement
        .peers
        .into_iter()
        .filter(|id| id != peer.id() && peer.connection(id).is_none())
        .filter(|id| seen.insert(id.clone()))
        .collect();

    for id in unknown {
        if let Err(e) = introduce(peer, connection, id.clone()).await {
            warn!(peer = %id, via = %connection.peer_id(), error = %e, "failed to reach announced peer");
        }
    }
    Ok(())
}

/// A pending connection takes the announced identity; a keyed one must
/// already carry it. Either failure removes the connection.
async fn settle_identity(
    peer: &LocalPeer,
    connection: &Arc<PeerConnection>,
    announced: PeerId,
) -> Result<()> {
    let key = connection.peer_id();
    if announced == key {
        return Ok(());
    }

    let result = if connection.is_pending() {
        peer.rekey(connection, announced)
    } else {
        Err(TetherError::IdentityConflict(format!(
            "connection {key} announced identity {announced}"
        )))
    };
    if result.is_err() {
        peer.remove_entry(connection, RemovalReason::IdentityConflict)
            .await;
    }
    result
}

async fn introduce(peer: &LocalPeer, via: &PeerConnection, id: PeerId) -> Result<()> {
    let Some(connection) = peer.add_connection(Some(id.clone())).await? else {
        debug!(peer = %id, "announced peer appeared meanwhile");
        return Ok(());
    };
    info!(peer = %id, via = %via.peer_id(), "discovered peer, offering through relay");
    let offer = connection.create_offer().await?;
    via.send(ChannelLabel::Description, &offer, Some(id)).await?;
    Ok(())
}
