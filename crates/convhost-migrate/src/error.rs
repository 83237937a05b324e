//! Migration error types

use convhost_common::CommonError;
use convhost_provider::ProviderError;
use convhost_sync::SyncError;
use thiserror::Error;

/// Result type for migration operations
pub type MigrationResult<T> = std::result::Result<T, MigrationError>;

/// Migration error
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Invalid request or settings; detected before any side effect
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An external resource never reached the expected state
    #[error("Timed out waiting for {what} after {attempts} attempt(s)")]
    Timeout { what: String, attempts: u32 },

    /// Block-status or transport data the engine cannot interpret
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Converter exited non-zero
    #[error("Conversion failed with exit status {status}")]
    Conversion { status: i32 },

    /// Platform operation failed
    #[error(transparent)]
    Provider(ProviderError),

    /// Sync pass failed
    #[error(transparent)]
    Sync(SyncError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SyncError> for MigrationError {
    fn from(e: SyncError) -> Self {
        if e.is_integrity() {
            MigrationError::Integrity(e.to_string())
        } else {
            MigrationError::Sync(e)
        }
    }
}

impl From<ProviderError> for MigrationError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unsupported(_) => MigrationError::Configuration(e.to_string()),
            ProviderError::Sync(inner) => inner.into(),
            other => MigrationError::Provider(other),
        }
    }
}

impl From<CommonError> for MigrationError {
    fn from(e: CommonError) -> Self {
        MigrationError::Configuration(e.to_string())
    }
}
