use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use tether_core::{MediaStream, MediaTrack, Result, TetherError, TrackKind};

/// What a media source should capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSourceKind {
    /// Camera and microphone.
    UserMedia,
    /// Screen capture.
    Display,
}

impl fmt::Display for MediaSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSourceKind::UserMedia => f.write_str("user media"),
            MediaSourceKind::Display => f.write_str("display"),
        }
    }
}

/// Acquires local media. Capture itself lives outside the mesh.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fails with `MediaUnavailable` when the device is missing or access
    /// was denied.
    async fn acquire(&self, kind: MediaSourceKind) -> Result<MediaStream>;
}

/// A media source that fabricates tracks, or refuses every request.
#[derive(Debug, Clone, Default)]
pub struct SyntheticMediaSource {
    denied: Option<String>,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that fails every acquisition with `reason`.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            denied: Some(reason.into()),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self, kind: MediaSourceKind) -> Result<MediaStream> {
        if let Some(reason) = &self.denied {
            return Err(TetherError::MediaUnavailable(format!("{kind}: {reason}")));
        }
        let tracks = match kind {
            MediaSourceKind::UserMedia => vec![
                Arc::new(MediaTrack::new(TrackKind::Audio, "synthetic microphone")),
                Arc::new(MediaTrack::new(TrackKind::Video, "synthetic camera")),
            ],
            MediaSourceKind::Display => {
                vec![Arc::new(MediaTrack::new(TrackKind::Video, "synthetic screen"))]
            }
        };
        Ok(MediaStream::new(tracks))
    }
}
