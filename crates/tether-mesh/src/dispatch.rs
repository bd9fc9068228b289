//! Session event pump and control-channel dispatch.
//!
//! Each connection gets one pump task that drains its session events, plus
//! one worker per control channel so messages on a label are handled in
//! arrival order while a slow handler (waiting on ICE) never stalls the
//! pump itself.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use tether_core::{ConnectionState, Event, RemovalReason, Result, SessionDescription};

use crate::channel::ChannelLabel;
use crate::connection::PeerConnection;
use crate::discovery;
use crate::envelope::{Envelope, Route};
use crate::protocol::PeerAnnouncement;
use crate::registry::{LocalPeer, WeakLocalPeer};
use crate::session::{SessionEvent, SessionEventReceiver};

type Inboxes = HashMap<ChannelLabel, mpsc::UnboundedSender<String>>;

pub(crate) fn spawn(
    peer: WeakLocalPeer,
    connection: &Arc<PeerConnection>,
    mut events: SessionEventReceiver,
) {
    let weak = Arc::downgrade(connection);
    let mut inboxes = Inboxes::new();
    for label in ChannelLabel::ALL {
        let (tx, rx) = mpsc::unbounded_channel();
        inboxes.insert(label, tx);
        tokio::spawn(run_channel(peer.clone(), weak.clone(), label, rx));
    }

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let (Some(peer), Some(connection)) = (peer.upgrade(), weak.upgrade()) else {
                break;
            };
            handle_session_event(&peer, &connection, &inboxes, event);
        }
        debug!("session event pump stopped");
    });
}

fn handle_session_event(
    peer: &LocalPeer,
    connection: &Arc<PeerConnection>,
    inboxes: &Inboxes,
    event: SessionEvent,
) {
    match event {
        SessionEvent::ConnectionStateChange(state) => {
            debug!(peer = %connection.peer_id(), %state, "connection state changed");
            peer.events().publish(Event::ConnectionStateChanged {
                peer_id: connection.peer_id(),
                state,
            });
            if state == ConnectionState::Connected {
                connection.mark_connected();
                let (peer, connection) = (peer.clone(), Arc::clone(connection));
                tokio::spawn(async move {
                    if let Err(e) = connection.attach_outbound(peer.streams()).await {
                        warn!(peer = %connection.peer_id(), error = %e, "failed to attach outbound streams");
                    }
                });
            } else if state.is_terminal() {
                let (peer, connection) = (peer.clone(), Arc::clone(connection));
                tokio::spawn(async move {
                    peer.remove_entry(&connection, RemovalReason::SessionTerminated)
                        .await;
                });
            }
        }
        SessionEvent::IceGatheringStateChange(state) => {
            debug!(peer = %connection.peer_id(), %state, "ICE gathering state changed");
            connection.observe_ice_gathering(state);
        }
        SessionEvent::IceConnectionStateChange(state) => {
            debug!(peer = %connection.peer_id(), %state, "ICE connection state changed");
        }
        SessionEvent::IceCandidate { candidate } => {
            // Candidates travel inside the gathered description.
            debug!(peer = %connection.peer_id(), ?candidate, "local ICE candidate");
        }
        SessionEvent::NegotiationNeeded => {
            let connection = Arc::clone(connection);
            tokio::spawn(async move {
                if let Err(e) = connection.renegotiate().await {
                    warn!(peer = %connection.peer_id(), error = %e, "renegotiation failed");
                }
            });
        }
        SessionEvent::Track { track, streams } => {
            if let Err(e) = connection.on_track(&track, &streams) {
                error!(peer = %connection.peer_id(), error = %e, "track event broke the one-stream contract");
                let (peer, connection) = (peer.clone(), Arc::clone(connection));
                tokio::spawn(async move {
                    peer.remove_entry(&connection, RemovalReason::ContractViolation)
                        .await;
                });
            }
        }
        SessionEvent::TrackRemoved { stream_id, track_id } => {
            debug!(peer = %connection.peer_id(), track = %track_id, "remote track removed");
            connection.on_track_removed(&stream_id);
        }
        SessionEvent::DataChannel { label } => match ChannelLabel::parse(&label) {
            Some(_) => debug!(peer = %connection.peer_id(), %label, "remote control channel"),
            None => warn!(peer = %connection.peer_id(), %label, "ignoring unknown data channel"),
        },
        SessionEvent::ChannelOpen { label } => {
            if let Some(label) = ChannelLabel::parse(&label) {
                on_channel_open(peer, connection, label);
            }
        }
        SessionEvent::ChannelMessage { label, payload } => {
            match ChannelLabel::parse(&label).and_then(|l| inboxes.get(&l)) {
                Some(inbox) => {
                    let _ = inbox.send(payload);
                }
                None => debug!(peer = %connection.peer_id(), %label, "message on unknown channel dropped"),
            }
        }
        SessionEvent::ChannelClose { label } => {
            debug!(peer = %connection.peer_id(), %label, "control channel closed");
        }
    }
}

fn on_channel_open(peer: &LocalPeer, connection: &Arc<PeerConnection>, label: ChannelLabel) {
    debug!(peer = %connection.peer_id(), %label, "control channel open");
    let (peer, connection) = (peer.clone(), Arc::clone(connection));
    match label {
        ChannelLabel::Description => {}
        ChannelLabel::Identity => {
            tokio::spawn(async move {
                if let Err(e) = discovery::announce(&peer, &connection).await {
                    warn!(peer = %connection.peer_id(), error = %e, "failed to announce identity");
                }
            });
        }
    }
}

async fn run_channel(
    peer: WeakLocalPeer,
    connection: Weak<PeerConnection>,
    label: ChannelLabel,
    mut inbox: mpsc::UnboundedReceiver<String>,
) {
    while let Some(payload) = inbox.recv().await {
        let (Some(peer), Some(connection)) = (peer.upgrade(), connection.upgrade()) else {
            break;
        };
        if let Err(e) = receive_or_relay(&peer, &connection, label, payload).await {
            if e.is_contract_violation() {
                error!(peer = %connection.peer_id(), %label, error = %e, "control message violated negotiation contract");
            } else {
                warn!(peer = %connection.peer_id(), %label, error = %e, "failed to handle control message");
            }
        }
    }
}

/// Handle one inbound control message: relay it if it is addressed to
/// someone else, otherwise run the label's handler.
pub(crate) async fn receive_or_relay(
    peer: &LocalPeer,
    connection: &Arc<PeerConnection>,
    label: ChannelLabel,
    payload: String,
) -> Result<()> {
    let envelope: Envelope = serde_json::from_str(&payload)?;
    match envelope.route(peer.id()) {
        Route::Relay(to) => {
            peer.relay(label, &envelope.from, &to, payload).await;
            Ok(())
        }
        Route::Local => match label {
            ChannelLabel::Description => on_description(peer, connection, envelope.decode()?).await,
            ChannelLabel::Identity => {
                let announcement = envelope.decode::<PeerAnnouncement>()?.message;
                discovery::on_announcement(peer, connection, announcement).await
            }
        },
    }
}

async fn on_description(
    peer: &LocalPeer,
    connection: &Arc<PeerConnection>,
    envelope: Envelope<SessionDescription>,
) -> Result<()> {
    if connection.is_pending() || envelope.from == connection.peer_id() {
        connection.receive_offer_or_answer(envelope.message).await?;
        return Ok(());
    }

    // Negotiation relayed on behalf of a peer we have no direct link to yet.
    let target = peer.connection_for(&envelope.from).await?;
    let answer = target.receive_offer_or_answer(envelope.message).await?;
    if let Some(answer) = answer {
        if !target.open_channels().contains(&ChannelLabel::Description) {
            connection
                .send(ChannelLabel::Description, &answer, Some(envelope.from))
                .await?;
        }
    }
    Ok(())
}
