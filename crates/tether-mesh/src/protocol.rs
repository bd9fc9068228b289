use serde::{Deserialize, Serialize};

use tether_core::{PeerId, SessionDescription};

/// Out-of-band bootstrap message.
///
/// The offerer sends `{fromId, connectionId, description}` where
/// `connectionId` is the placeholder key of its pending connection. The
/// answerer echoes that key back so the offerer can find the connection
/// and re-key it under the answerer's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstDescription {
    pub from_id: PeerId,
    pub connection_id: PeerId,
    pub description: SessionDescription,
}

/// Simpler one-to-one pairing message: `{id, description}`.
///
/// Only one direct pairing can be outstanding per local peer, so no
/// placeholder key travels with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectDescription {
    pub id: PeerId,
    pub description: SessionDescription,
}

/// Sent once on the identity channel: who the sender is, and which peers
/// it holds live sessions with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub id: PeerId,
    #[serde(default)]
    pub peers: Vec<PeerId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_description_wire_names() {
        let msg = FirstDescription {
            from_id: PeerId::new("x"),
            connection_id: PeerId::new("y"),
            description: SessionDescription::offer("v=0"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["fromId"], "x");
        assert_eq!(json["connectionId"], "y");
        assert_eq!(json["description"]["type"], "offer");
    }

    #[test]
    fn test_parse_first_description_from_browser() {
        let raw = r#"{"fromId":"b","connectionId":"a1","description":{"type":"answer","sdp":""}}"#;
        let msg: FirstDescription = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.connection_id.as_str(), "a1");
        assert!(msg.description.is_answer());
    }

    #[test]
    fn test_announcement_without_peers() {
        let msg: PeerAnnouncement = serde_json::from_str(r#"{"id":"c"}"#).unwrap();
        assert_eq!(msg.id.as_str(), "c");
        assert!(msg.peers.is_empty());
    }
}
