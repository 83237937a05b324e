//! Files an operator uses to steer a running migration
//!
//! The cutover sentinel requests the final pass by merely existing. The
//! limits file holds `{"cpu": n|null, "network": n|null}` and is re-read
//! before every sync round.

use crate::error::{MigrationError, MigrationResult};

use convhost_sync::{Throttling, TokenBucket};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CutoverSignal {
    path: PathBuf,
}

impl CutoverSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_requested(&self) -> bool {
        self.path.exists()
    }
}

#[derive(Debug, Deserialize)]
struct LimitsDocument {
    #[serde(default)]
    cpu: Option<u64>,
    /// Bytes per second
    #[serde(default)]
    network: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LimitsFile {
    path: PathBuf,
}

impl LimitsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Current limits, `None` while no file exists
    pub fn read(&self) -> MigrationResult<Option<Throttling>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let doc: LimitsDocument = serde_json::from_slice(&data).map_err(|e| {
            MigrationError::Configuration(format!("limits file {}: {e}", self.path.display()))
        })?;
        if let Some(network) = doc.network.filter(|n| *n > TokenBucket::MAX_RATE) {
            return Err(MigrationError::Configuration(format!(
                "limits file {}: network limit {network} B/s is out of range",
                self.path.display()
            )));
        }
        Ok(Some(Throttling {
            cpu: doc.cpu,
            network: doc.network,
        }))
    }
}
