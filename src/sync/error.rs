use crate::sync::protocol::ProtocolError;

/// Errors surfaced by the device side of a sync.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The pairing payload is past its `expires_at`; generate a new one.
    #[error("pairing payload expired at {expires_at} (now {now})")]
    ExpiredPairing { expires_at: i64, now: i64 },

    #[error("invalid pairing code: {0}")]
    InvalidPairing(String),

    /// The exchange stopped before completion. Records merged so far are
    /// kept.
    #[error("sync incomplete: {reason} ({received} records merged)")]
    PartialSync { reason: String, received: u64 },

    /// A peer or the relay reported an error.
    #[error("remote error from {from}: {code}: {message}")]
    Remote {
        from: String,
        code: String,
        message: String,
    },

    #[error("sync timed out after {0} seconds")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
