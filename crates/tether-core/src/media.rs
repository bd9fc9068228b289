//! Opaque media handles.
//!
//! Capture and rendering live outside the mesh; the core only needs stable
//! tokens, the track list of a stream, and the enable/stop switches.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::{StreamId, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single audio or video track.
#[derive(Debug)]
pub struct MediaTrack {
    id: TrackId,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(TrackId::generate(), kind, label)
    }

    pub fn with_id(id: TrackId, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &TrackId {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Release the underlying device. Irreversible.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct StreamInner {
    id: StreamId,
    tracks: Vec<Arc<MediaTrack>>,
}

/// A media stream handle. Cloning shares the same underlying stream.
#[derive(Debug, Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self::with_id(StreamId::generate(), tracks)
    }

    pub fn with_id(id: StreamId, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            inner: Arc::new(StreamInner { id, tracks }),
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.inner.tracks
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.inner.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&self) {
        for track in &self.inner.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.tracks.iter().all(|t| t.is_stopped())
    }
}
