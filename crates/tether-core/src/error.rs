use thiserror::Error;

/// Unified error type for the entire Tether mesh.
#[derive(Error, Debug)]
pub enum TetherError {
    // ── Negotiation contract violations ────────────────────────
    #[error("invalid description type: expected {expected}, got {actual}")]
    InvalidDescriptionType { expected: String, actual: String },

    #[error("track event carried {0} streams, expected exactly 1")]
    UnexpectedMultiStreamEvent(usize),

    // ── Identity / registry conflicts ──────────────────────────
    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    // ── Transport errors ───────────────────────────────────────
    #[error("transport error: {0}")]
    Transport(String),

    #[error("control channel not found: {0}")]
    ChannelNotFound(String),

    #[error("session closed")]
    SessionClosed,

    // ── Media errors ───────────────────────────────────────────
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TetherError {
    /// Whether this error is a caller contract violation that must never be retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            TetherError::InvalidDescriptionType { .. } | TetherError::UnexpectedMultiStreamEvent(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
