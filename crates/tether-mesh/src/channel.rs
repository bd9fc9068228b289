//! Control channels: the named data channels every connection opens.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tether_core::{Result, TetherError};

use crate::session::{DataChannel, Session};

/// Label of a control channel. Each label has exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelLabel {
    /// Offers and answers after the first.
    Description,
    /// The sender's identity and the peers it is connected to, sent once
    /// on open.
    Identity,
}

impl ChannelLabel {
    pub const ALL: [ChannelLabel; 2] = [ChannelLabel::Description, ChannelLabel::Identity];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelLabel::Description => "sdp",
            ChannelLabel::Identity => "id",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == label)
    }
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The send halves of a connection's control channels.
pub struct ChannelSet {
    channels: HashMap<ChannelLabel, Arc<dyn DataChannel>>,
}

impl ChannelSet {
    /// Create one channel per label on `session`.
    pub async fn create(session: &dyn Session) -> Result<Self> {
        let mut channels = HashMap::with_capacity(ChannelLabel::ALL.len());
        for label in ChannelLabel::ALL {
            let channel = session.create_data_channel(label.as_str()).await?;
            channels.insert(label, channel);
        }
        Ok(Self { channels })
    }

    pub fn get(&self, label: ChannelLabel) -> Result<&Arc<dyn DataChannel>> {
        self.channels
            .get(&label)
            .ok_or_else(|| TetherError::ChannelNotFound(label.to_string()))
    }

    pub fn open_labels(&self) -> Vec<ChannelLabel> {
        ChannelLabel::ALL
            .into_iter()
            .filter(|l| self.channels.get(l).is_some_and(|c| c.is_open()))
            .collect()
    }
}
