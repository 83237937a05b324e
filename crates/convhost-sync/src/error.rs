//! Sync engine error types

use thiserror::Error;

/// Result type for sync operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Sync engine error
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error on the destination or a local source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport session failed (connection lost, server error reply)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer answered with something we cannot interpret safely
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Checkpoint could not be written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// State is finished and refuses further changes
    #[error("Migration state is finished; refusing to modify it")]
    StateFinished,

    /// Unknown disk id in the migration state
    #[error("Disk not tracked in migration state: {0}")]
    UnknownDisk(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// True for errors meaning the data stream can no longer be trusted
    pub fn is_integrity(&self) -> bool {
        matches!(self, SyncError::Protocol(_))
    }
}
