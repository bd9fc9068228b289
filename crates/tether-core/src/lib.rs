//! # tether-core
//!
//! Core types, handles, and primitives for the Tether peer mesh.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! identities, session descriptions, negotiation states, media handles, and the
//! unified error type.

pub mod description;
pub mod error;
pub mod event;
pub mod media;
pub mod types;

pub use description::{SdpType, SessionDescription};
pub use error::{Result, TetherError};
pub use event::{Event, EventBus, RemovalReason};
pub use media::{MediaStream, MediaTrack, TrackKind};
pub use types::*;
