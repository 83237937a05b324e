//! Migration state and its durable checkpoint
//!
//! [`MigrationState`] is the single record of progress for one run. It is
//! serialized in full on every write; the JSON field names are stable so an
//! external progress reporter (or a later run) can read the file.
//!
//! Once the state is finished every mutator returns
//! [`SyncError::StateFinished`].

use crate::error::{SyncError, SyncResult};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Controller phase, recorded for observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Preparing,
    Inspecting,
    Provisioning,
    Syncing,
    CuttingOver,
    Converting,
    Finalizing,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

/// Resource limits applied to the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttling {
    /// CPU limit in percent of one core
    pub cpu: Option<u64>,
    /// Network limit in bytes per second
    pub network: Option<u64>,
}

/// Progress of one incremental pass over one disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub to_copy: u64,
    pub copied: u64,
    /// Change-tracking reference reached by this pass; set when the pass completes
    #[serde(default)]
    pub change_id: Option<String>,
}

impl SyncAttempt {
    pub fn is_complete(&self) -> bool {
        self.change_id.is_some()
    }
}

/// Per-disk sync history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSyncState {
    /// Source path of the disk
    pub path: String,
    /// One entry per pass, append-only
    #[serde(default)]
    pub syncs: Vec<SyncAttempt>,
}

impl DiskSyncState {
    /// Reference point of the last completed pass, if any
    pub fn last_change_id(&self) -> Option<&str> {
        self.syncs
            .iter()
            .rev()
            .find_map(|attempt| attempt.change_id.as_deref())
    }
}

/// Progress and outcome of one migration run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
    finished: bool,
    failed: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    phase: Phase,
    #[serde(default)]
    disk_count: usize,
    #[serde(default)]
    vm_id: Option<String>,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    disks: BTreeMap<String, DiskSyncState>,
    #[serde(default)]
    throttling: Throttling,
}

impl MigrationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn disk_count(&self) -> usize {
        self.disk_count
    }

    pub fn vm_id(&self) -> Option<&str> {
        self.vm_id.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn throttling(&self) -> Throttling {
        self.throttling
    }

    pub fn disks(&self) -> &BTreeMap<String, DiskSyncState> {
        &self.disks
    }

    pub fn disk(&self, id: &str) -> Option<&DiskSyncState> {
        self.disks.get(id)
    }

    pub fn attempt(&self, disk_id: &str, index: usize) -> Option<&SyncAttempt> {
        self.disks.get(disk_id).and_then(|d| d.syncs.get(index))
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.finished {
            return Err(SyncError::StateFinished);
        }
        Ok(())
    }

    fn attempt_mut(&mut self, disk_id: &str, index: usize) -> SyncResult<&mut SyncAttempt> {
        self.ensure_open()?;
        self.disks
            .get_mut(disk_id)
            .and_then(|d| d.syncs.get_mut(index))
            .ok_or_else(|| SyncError::UnknownDisk(format!("{disk_id} (attempt {index})")))
    }

    pub fn set_phase(&mut self, phase: Phase) -> SyncResult<()> {
        self.ensure_open()?;
        self.phase = phase;
        Ok(())
    }

    pub fn set_disk_count(&mut self, count: usize) -> SyncResult<()> {
        self.ensure_open()?;
        self.disk_count = count;
        Ok(())
    }

    pub fn set_vm_id(&mut self, vm_id: impl Into<String>) -> SyncResult<()> {
        self.ensure_open()?;
        self.vm_id = Some(vm_id.into());
        Ok(())
    }

    pub fn set_pid(&mut self, pid: Option<u32>) -> SyncResult<()> {
        self.ensure_open()?;
        self.pid = pid;
        Ok(())
    }

    pub fn set_throttling(&mut self, throttling: Throttling) -> SyncResult<()> {
        self.ensure_open()?;
        self.throttling = throttling;
        Ok(())
    }

    /// Start tracking a disk. Existing history for the id is kept.
    pub fn track_disk(&mut self, disk_id: &str, path: &str) -> SyncResult<()> {
        self.ensure_open()?;
        self.disks
            .entry(disk_id.to_string())
            .or_insert_with(|| DiskSyncState {
                path: path.to_string(),
                syncs: Vec::new(),
            });
        Ok(())
    }

    /// Append a fresh attempt for a disk and return its index
    pub fn begin_attempt(&mut self, disk_id: &str) -> SyncResult<usize> {
        self.ensure_open()?;
        let disk = self
            .disks
            .get_mut(disk_id)
            .ok_or_else(|| SyncError::UnknownDisk(disk_id.to_string()))?;
        disk.syncs.push(SyncAttempt::default());
        Ok(disk.syncs.len() - 1)
    }

    pub fn set_to_copy(&mut self, disk_id: &str, index: usize, to_copy: u64) -> SyncResult<()> {
        let attempt = self.attempt_mut(disk_id, index)?;
        if attempt.copied > to_copy {
            return Err(SyncError::Checkpoint(format!(
                "to_copy {to_copy} below already copied {}",
                attempt.copied
            )));
        }
        attempt.to_copy = to_copy;
        Ok(())
    }

    /// Add to `copied`; the total never exceeds `to_copy`
    pub fn add_copied(&mut self, disk_id: &str, index: usize, bytes: u64) -> SyncResult<u64> {
        let attempt = self.attempt_mut(disk_id, index)?;
        let copied = attempt.copied + bytes;
        if copied > attempt.to_copy {
            return Err(SyncError::Checkpoint(format!(
                "copied {copied} would exceed to_copy {}",
                attempt.to_copy
            )));
        }
        attempt.copied = copied;
        Ok(copied)
    }

    /// Close an attempt by recording the reference point it reached
    pub fn complete_attempt(
        &mut self,
        disk_id: &str,
        index: usize,
        change_id: impl Into<String>,
    ) -> SyncResult<()> {
        self.attempt_mut(disk_id, index)?.change_id = Some(change_id.into());
        Ok(())
    }

    pub fn mark_succeeded(&mut self) -> SyncResult<()> {
        self.ensure_open()?;
        self.phase = Phase::Succeeded;
        self.finished = true;
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> SyncResult<()> {
        self.ensure_open()?;
        self.phase = Phase::Failed;
        self.message = Some(message.into());
        self.failed = true;
        self.finished = true;
        Ok(())
    }
}

// ── CheckpointStore ───────────────────────────────────────────────────────────

/// Atomic JSON checkpoint at a fixed path
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the checkpoint with `state`.
    ///
    /// The state goes to a temporary file in the same directory, is synced,
    /// and is renamed over the target. Readers see either the previous or the
    /// new content.
    pub fn write(&self, state: &MigrationState) -> SyncResult<()> {
        write_atomic(&self.path, &serde_json::to_vec(state)?)
    }

    /// [`write`](Self::write) with the file work on the blocking pool
    pub async fn persist(&self, state: &MigrationState) -> SyncResult<()> {
        let data = serde_json::to_vec(state)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &data))
            .await
            .map_err(|e| SyncError::Checkpoint(format!("checkpoint task failed: {e}")))?
    }

    /// Read a checkpoint
    pub fn load(path: impl AsRef<Path>) -> SyncResult<MigrationState> {
        let data = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> SyncResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".checkpoint-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| SyncError::Checkpoint(format!("rename into {}: {}", path.display(), e.error)))?;

    trace!(path = %path.display(), "Checkpoint written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked_state() -> MigrationState {
        let mut state = MigrationState::new();
        state.track_disk("disk-1", "[ds1] web/web.vmdk").unwrap();
        state
    }

    #[test]
    fn test_attempt_lifecycle() {
        let mut state = tracked_state();
        let idx = state.begin_attempt("disk-1").unwrap();
        assert_eq!(idx, 0);
        state.set_to_copy("disk-1", idx, 100).unwrap();
        assert_eq!(state.add_copied("disk-1", idx, 40).unwrap(), 40);
        assert_eq!(state.add_copied("disk-1", idx, 60).unwrap(), 100);
        assert!(state.add_copied("disk-1", idx, 1).is_err());

        assert_eq!(state.disk("disk-1").unwrap().last_change_id(), None);
        state.complete_attempt("disk-1", idx, "52 aa/14").unwrap();
        let second = state.begin_attempt("disk-1").unwrap();
        assert_eq!(second, 1);
        assert_eq!(state.disk("disk-1").unwrap().last_change_id(), Some("52 aa/14"));
    }

    #[test]
    fn test_unknown_disk() {
        let mut state = MigrationState::new();
        assert!(matches!(
            state.begin_attempt("nope"),
            Err(SyncError::UnknownDisk(_))
        ));
    }

    #[test]
    fn test_finished_state_refuses_changes() {
        let mut state = tracked_state();
        state.mark_failed("boom").unwrap();
        assert!(state.finished());
        assert!(state.failed());
        assert_eq!(state.message(), Some("boom"));
        assert_eq!(state.phase(), Phase::Failed);

        let before = state.clone();
        assert!(matches!(state.set_phase(Phase::Syncing), Err(SyncError::StateFinished)));
        assert!(matches!(state.begin_attempt("disk-1"), Err(SyncError::StateFinished)));
        assert!(matches!(state.mark_succeeded(), Err(SyncError::StateFinished)));
        assert_eq!(state, before);
    }

    #[test]
    fn test_json_field_names() {
        let mut state = tracked_state();
        let idx = state.begin_attempt("disk-1").unwrap();
        state.set_to_copy("disk-1", idx, 10).unwrap();
        state.set_throttling(Throttling { cpu: Some(50), network: None }).unwrap();
        state.set_phase(Phase::CuttingOver).unwrap();

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["finished"], false);
        assert_eq!(value["failed"], false);
        assert_eq!(value["phase"], "cutting_over");
        assert_eq!(value["disks"]["disk-1"]["path"], "[ds1] web/web.vmdk");
        assert_eq!(value["disks"]["disk-1"]["syncs"][0]["to_copy"], 10);
        assert_eq!(value["disks"]["disk-1"]["syncs"][0]["copied"], 0);
        assert_eq!(value["throttling"]["cpu"], 50);
        assert!(value["throttling"]["network"].is_null());
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("20260101T000000.state"));
        let mut state = tracked_state();
        store.write(&state).unwrap();
        state.set_phase(Phase::Syncing).unwrap();
        store.write(&state).unwrap();

        let loaded = CheckpointStore::load(store.path()).unwrap();
        assert_eq!(loaded, state);

        // Only the target remains in the directory
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_matches_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run.state"));
        let mut state = tracked_state();
        state.set_disk_count(1).unwrap();
        store.persist(&state).await.unwrap();

        assert_eq!(CheckpointStore::load(store.path()).unwrap(), state);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_interrupted_write_leaves_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("run.state"));
        let state = tracked_state();
        store.write(&state).unwrap();

        // A writer that dies before the rename leaves only a stray temp file
        let mut partial = tempfile::Builder::new()
            .prefix(".checkpoint-")
            .suffix(".tmp")
            .tempfile_in(dir.path())
            .unwrap();
        partial.write_all(b"{\"finished\": tr").unwrap();
        let (_file, _kept) = partial.keep().unwrap();

        let loaded = CheckpointStore::load(store.path()).unwrap();
        assert_eq!(loaded, state);
    }
}
