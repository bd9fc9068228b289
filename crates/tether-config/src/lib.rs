//! # tether-config
//!
//! Configuration system for Tether. Reads from `tether.toml`, environment
//! variables, and CLI overrides, in that precedence order.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::{ConfigLoader, ConfigWatcher};
pub use schema::TetherConfig;
pub use schema::{
    ConfigWarning, GlareRule, IceServer, LoggingConfig, PeerConfig, SessionConfig, WarningSeverity,
};
