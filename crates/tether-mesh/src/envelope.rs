//! Addressed wrapper for every control-channel message.
//!
//! Wire shape: `{"from": "<peer>", "to": "<peer>" | null, "message": <body>}`.
//! A null `to` means "for whoever receives this directly".

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::PeerId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    /// Originator. Never rewritten while relaying.
    pub from: PeerId,
    #[serde(default)]
    pub to: Option<PeerId>,
    pub message: T,
}

/// Where an inbound envelope goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Relay(PeerId),
}

impl<T> Envelope<T> {
    pub fn new(from: PeerId, to: Option<PeerId>, message: T) -> Self {
        Self { from, to, message }
    }

    /// Local if unaddressed or addressed to `local`, otherwise relay to `to`.
    pub fn route(&self, local: &PeerId) -> Route {
        match &self.to {
            Some(to) if to != local => Route::Relay(to.clone()),
            _ => Route::Local,
        }
    }
}

impl Envelope<Value> {
    pub fn decode<T: serde::de::DeserializeOwned>(self) -> serde_json::Result<Envelope<T>> {
        Ok(Envelope {
            from: self.from,
            to: self.to,
            message: serde_json::from_value(self.message)?,
        })
    }
}

/// Wrap `body` unless it already carries an originator.
///
/// Relayed envelopes pass through `send` again; wrapping them twice would
/// bury the real originator.
pub fn wrap(body: Value, from: &PeerId, to: Option<&PeerId>) -> Value {
    if is_enveloped(&body) {
        return body;
    }
    serde_json::json!({
        "from": from,
        "to": to,
        "message": body,
    })
}

pub fn is_enveloped(body: &Value) -> bool {
    body.as_object().is_some_and(|o| o.contains_key("from"))
}
