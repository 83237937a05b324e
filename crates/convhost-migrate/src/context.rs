//! Per-run context
//!
//! Everything a run needs to know about where it lives: the work directory,
//! the run timestamp and the files derived from it. Built once by the
//! runner and handed to the controller.

use chrono::{DateTime, Utc};
use convhost_common::PathsConfig;
use std::path::{Path, PathBuf};

/// Timestamp format shared by the run's files and snapshot names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Clone)]
pub struct RunContext {
    vm_name: String,
    work_dir: PathBuf,
    log_dir: PathBuf,
    timestamp: String,
}

impl RunContext {
    pub fn new(paths: &PathsConfig, vm_name: &str, started: DateTime<Utc>) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            work_dir: paths.work_root.join(vm_name),
            log_dir: paths.log_root.join(vm_name),
            timestamp: started.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// Create the work area: `<work>/disks` and `<work>/nbd`
    pub fn establish(self) -> std::io::Result<Self> {
        std::fs::create_dir_all(self.disks_dir())?;
        std::fs::create_dir_all(self.nbd_dir())?;
        Ok(self)
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn disks_dir(&self) -> PathBuf {
        self.work_dir.join("disks")
    }

    pub fn nbd_dir(&self) -> PathBuf {
        self.work_dir.join("nbd")
    }

    pub fn state_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.state", self.timestamp))
    }

    pub fn cutover_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.cutover", self.timestamp))
    }

    pub fn limits_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.limits", self.timestamp))
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(&self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            work_root: dir.path().join("work"),
            log_root: dir.path().join("log"),
        };
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let ctx = RunContext::new(&paths, "web01", started).establish().unwrap();

        assert_eq!(ctx.timestamp(), "20240309T140507");
        assert_eq!(ctx.state_path(), dir.path().join("work/web01/20240309T140507.state"));
        assert_eq!(ctx.cutover_path(), dir.path().join("work/web01/20240309T140507.cutover"));
        assert_eq!(ctx.limits_path(), dir.path().join("work/web01/20240309T140507.limits"));
        assert_eq!(ctx.log_file(), dir.path().join("log/web01/20240309T140507"));
        assert!(ctx.disks_dir().is_dir());
        assert!(ctx.nbd_dir().is_dir());
    }
}
