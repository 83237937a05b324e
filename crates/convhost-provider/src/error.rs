//! Provider error types

use convhost_sync::SyncError;
use thiserror::Error;

/// Result type for provider operations
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Provider error
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Platform kind or transport not available in this build
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// VM, disk or NIC not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Snapshot not found
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Change tracking is required but not enabled
    #[error("Change tracking is not enabled on VM {0}")]
    ChangeTrackingDisabled(String),

    /// Reference point unknown to the change tracker
    #[error("Unknown change id '{0}'")]
    UnknownChangeId(String),

    /// Guest inspection failed
    #[error("Inspection failed: {0}")]
    Inspection(String),

    /// Disk could not be exposed for transport
    #[error("Disk exposure failed: {0}")]
    Exposure(String),

    /// Platform refused the operation
    #[error("Platform error: {0}")]
    Platform(String),

    /// Converter could not be run
    #[error("Converter error: {0}")]
    Converter(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport session error
    #[error(transparent)]
    Sync(#[from] SyncError),
}
