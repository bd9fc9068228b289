//! # tether-cli
//!
//! Command-line interface for the Tether peer mesh.
//!
//! ## Commands
//!
//! - `tether demo`: Form an in-process mesh and print its connection table
//! - `tether offer` / `tether answer`: Pair two processes over WebRTC (`webrtc` feature)
//! - `tether config`: Show the effective configuration
//! - `tether doctor`: Audit configuration
//! - `tether version`: Show version and build info

pub mod commands;

pub use commands::Cli;
