//! Offer/answer state handling, glare refusal and the ICE-gathering gate.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use tether_config::GlareRule;
use tether_core::{
    IceGatheringState, PeerId, Result, SdpType, SessionDescription, SignalingState, TetherError,
};

use crate::session::Session;

/// What a connection does with an incoming offer while its own offer is
/// outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Ignore the incoming offer and wait for an answer to ours.
    Refuse,
    /// Roll back our offer and answer theirs.
    Accept,
}

/// Decides the conflict policy for a pair of identities.
///
/// Both ends of a connection must reach opposite answers, otherwise glare
/// either deadlocks (both refuse) or is resolved twice (both accept).
pub trait GlareResolver: Send + Sync {
    fn policy(&self, local: &PeerId, remote: &PeerId) -> ConflictPolicy;
}

impl GlareResolver for GlareRule {
    fn policy(&self, local: &PeerId, remote: &PeerId) -> ConflictPolicy {
        let local_is_lower = local < remote;
        let refuses = match self {
            GlareRule::LowerIdRefuses => local_is_lower,
            GlareRule::HigherIdRefuses => !local_is_lower,
        };
        if refuses {
            ConflictPolicy::Refuse
        } else {
            ConflictPolicy::Accept
        }
    }
}

/// Outcome of applying a remote description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Offer ignored because of glare.
    Refused,
    /// Offer applied; an answer must follow.
    AnswerRequired,
    /// Answer applied; negotiation complete.
    Settled,
}

/// Suspends callers until the session reports ICE gathering complete.
#[derive(Default)]
pub(crate) struct IceGate {
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl IceGate {
    /// Feed a gathering-state change. Fires every waiter on `Complete`.
    pub fn observe(&self, state: IceGatheringState) {
        if state != IceGatheringState::Complete {
            return;
        }
        let waiters: Vec<_> = self.waiters.lock().drain(..).collect();
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Drop every waiter; they resolve with `SessionClosed`.
    pub fn close(&self) {
        self.waiters.lock().clear();
    }

    pub async fn wait(&self, session: &dyn Session, timeout: Option<Duration>) -> Result<()> {
        if session.ice_gathering_state() == IceGatheringState::Complete {
            return Ok(());
        }
        let rx = self.register();
        // Gathering may have completed between the check and the registration.
        if session.ice_gathering_state() == IceGatheringState::Complete {
            drop(rx);
            self.prune();
            return Ok(());
        }
        self.fired(rx, timeout).await
    }

    fn register(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(tx);
        rx
    }

    async fn fired(&self, rx: oneshot::Receiver<()>, timeout: Option<Duration>) -> Result<()> {
        let fired = async { rx.await.map_err(|_| TetherError::SessionClosed) };
        let Some(limit) = timeout else {
            return fired.await;
        };
        match tokio::time::timeout(limit, fired).await {
            Ok(result) => result,
            Err(_) => {
                self.prune();
                Err(TetherError::Transport(format!(
                    "ICE gathering did not complete within {limit:?}"
                )))
            }
        }
    }

    /// Forget waiters whose caller has gone away.
    fn prune(&self) {
        self.waiters.lock().retain(|waiter| !waiter.is_closed());
    }
}

/// Per-connection negotiation driver.
pub(crate) struct Negotiator {
    session: Arc<dyn Session>,
    policy: Mutex<Option<ConflictPolicy>>,
    ice: IceGate,
    ice_timeout: Option<Duration>,
}

impl Negotiator {
    pub fn new(session: Arc<dyn Session>, ice_timeout: Option<Duration>) -> Self {
        Self {
            session,
            policy: Mutex::new(None),
            ice: IceGate::default(),
            ice_timeout,
        }
    }

    /// `None` until the remote identity is known.
    pub fn policy(&self) -> Option<ConflictPolicy> {
        *self.policy.lock()
    }

    pub fn set_policy(&self, policy: ConflictPolicy) {
        *self.policy.lock() = Some(policy);
    }

    pub fn ice(&self) -> &IceGate {
        &self.ice
    }

    pub async fn begin_offer(&self) -> Result<SessionDescription> {
        match self.session.signaling_state() {
            SignalingState::Closed => Err(TetherError::SessionClosed),
            SignalingState::HaveRemoteOffer | SignalingState::HaveRemotePranswer => {
                Err(TetherError::InvalidDescriptionType {
                    expected: SdpType::Answer.to_string(),
                    actual: SdpType::Offer.to_string(),
                })
            }
            _ => self.session.create_local_description(SdpType::Offer).await,
        }
    }

    pub async fn begin_answer(&self) -> Result<SessionDescription> {
        match self.session.signaling_state() {
            SignalingState::HaveRemoteOffer => {
                self.session.create_local_description(SdpType::Answer).await
            }
            SignalingState::Closed => Err(TetherError::SessionClosed),
            _ => Err(TetherError::InvalidDescriptionType {
                expected: SdpType::Offer.to_string(),
                actual: SdpType::Answer.to_string(),
            }),
        }
    }

    pub async fn apply_remote(&self, description: SessionDescription) -> Result<RemoteOutcome> {
        let state = self.session.signaling_state();
        if state == SignalingState::Closed {
            return Err(TetherError::SessionClosed);
        }

        match description.sdp_type {
            SdpType::Offer => {
                if state == SignalingState::HaveLocalOffer
                    && self.policy() == Some(ConflictPolicy::Refuse)
                {
                    debug!("refusing offer, local offer outstanding");
                    return Ok(RemoteOutcome::Refused);
                }
                self.session.apply_remote_description(description).await?;
                Ok(RemoteOutcome::AnswerRequired)
            }
            SdpType::Answer => {
                if state != SignalingState::HaveLocalOffer {
                    return Err(TetherError::InvalidDescriptionType {
                        expected: SdpType::Offer.to_string(),
                        actual: SdpType::Answer.to_string(),
                    });
                }
                self.session.apply_remote_description(description).await?;
                Ok(RemoteOutcome::Settled)
            }
            other => Err(TetherError::InvalidDescriptionType {
                expected: "offer or answer".into(),
                actual: other.to_string(),
            }),
        }
    }

    /// Wait for ICE gathering, then return the full local description.
    pub async fn gathered_local_description(&self) -> Result<SessionDescription> {
        self.ice.wait(self.session.as_ref(), self.ice_timeout).await?;
        self.session
            .local_description()
            .await
            .ok_or_else(|| TetherError::Transport("no local description after gathering".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glare_rules_are_complementary() {
        let a = PeerId::new("aaa");
        let b = PeerId::new("bbb");
        for rule in [GlareRule::LowerIdRefuses, GlareRule::HigherIdRefuses] {
            assert_ne!(rule.policy(&a, &b), rule.policy(&b, &a));
        }
        assert_eq!(
            GlareRule::LowerIdRefuses.policy(&a, &b),
            ConflictPolicy::Refuse
        );
        assert_eq!(
            GlareRule::HigherIdRefuses.policy(&a, &b),
            ConflictPolicy::Accept
        );
    }

    #[tokio::test]
    async fn test_ice_gate_fires_all_waiters_on_complete() {
        let gate = Arc::new(IceGate::default());
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        gate.waiters.lock().extend([tx1, tx2]);

        gate.observe(IceGatheringState::Gathering);
        assert_eq!(gate.waiters.lock().len(), 2);

        gate.observe(IceGatheringState::Complete);
        assert!(gate.waiters.lock().is_empty());
        rx1.await.unwrap();
        rx2.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ice_gate_timeout_unregisters_waiter() {
        let gate = IceGate::default();
        let (tx, _other) = oneshot::channel::<()>();
        gate.waiters.lock().push(tx);

        let rx = gate.register();
        let err = gate
            .fired(rx, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Transport(_)));
        assert_eq!(gate.waiters.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ice_gate_close_drops_waiters() {
        let gate = IceGate::default();
        let (tx, rx) = oneshot::channel::<()>();
        gate.waiters.lock().push(tx);
        gate.close();
        assert!(rx.await.is_err());
    }
}
