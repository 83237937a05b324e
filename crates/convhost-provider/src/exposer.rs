//! Disk exposure
//!
//! Turns a frozen source disk into a [`BlockTransport`] session, either by
//! opening the image directly or by serving it through an `nbdkit` process
//! on a Unix socket.

use crate::capabilities::{DiskExposer, SessionOptions, SnapshotRef};
use crate::error::{ProviderError, ProviderResult};

use async_trait::async_trait;
use convhost_common::{DiskDescriptor, PollBudget};
use convhost_sync::{
    BlockTransport, FileTransport, NbdTransport, ReadCompletion, RequestId, StatusExtent,
    SyncResult,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

fn frozen_path<'a>(disk: &DiskDescriptor, snapshot: &'a SnapshotRef) -> ProviderResult<&'a str> {
    snapshot
        .disk(&disk.id)
        .map(|d| d.path.as_str())
        .ok_or_else(|| {
            ProviderError::SnapshotNotFound(format!("{} has no disk {}", snapshot.name, disk.id))
        })
}

// ── Direct file access ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct FileExposer;

#[async_trait]
impl DiskExposer for FileExposer {
    async fn expose_disk(
        &self,
        disk: &DiskDescriptor,
        snapshot: &SnapshotRef,
        _options: &SessionOptions,
    ) -> ProviderResult<Box<dyn BlockTransport>> {
        let path = frozen_path(disk, snapshot)?;
        let transport = FileTransport::open(path)?;
        Ok(Box::new(transport))
    }
}

// ── nbdkit ────────────────────────────────────────────────────────────────────

/// Serves frozen disks through `nbdkit`'s file plugin
#[derive(Debug, Clone)]
pub struct NbdkitExposer {
    program: String,
    socket_budget: PollBudget,
}

impl NbdkitExposer {
    pub fn new(socket_budget: PollBudget) -> Self {
        Self {
            program: "nbdkit".to_string(),
            socket_budget,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, socket: &Path, image: &str, read_only: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--unix")
            .arg(socket)
            .arg("--exit-with-parent")
            .arg("--foreground");
        if read_only {
            cmd.arg("--read-only");
        }
        cmd.arg("file")
            .arg(format!("file={image}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn wait_for_socket(&self, child: &mut Child, socket: &Path) -> ProviderResult<NbdTransport<UnixStream>> {
        for attempt in 1..=self.socket_budget.attempts {
            if let Some(status) = child.try_wait()? {
                return Err(ProviderError::Exposure(format!(
                    "{} exited with {status} before serving {}",
                    self.program,
                    socket.display()
                )));
            }
            if socket.exists() {
                match NbdTransport::connect_unix(socket, "").await {
                    Ok(transport) => return Ok(transport),
                    Err(e) => debug!("Socket {} not ready ({e}), attempt {attempt}", socket.display()),
                }
            }
            tokio::time::sleep(self.socket_budget.delay()).await;
        }
        Err(ProviderError::Exposure(format!(
            "socket {} did not come up after {} attempt(s)",
            socket.display(),
            self.socket_budget.attempts
        )))
    }
}

fn socket_name(disk_id: &str) -> String {
    let safe: String = disk_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{safe}.sock")
}

#[async_trait]
impl DiskExposer for NbdkitExposer {
    async fn expose_disk(
        &self,
        disk: &DiskDescriptor,
        snapshot: &SnapshotRef,
        options: &SessionOptions,
    ) -> ProviderResult<Box<dyn BlockTransport>> {
        let image = frozen_path(disk, snapshot)?;
        tokio::fs::create_dir_all(&options.socket_dir).await?;
        let socket = options.socket_dir.join(socket_name(&disk.id));
        match tokio::fs::remove_file(&socket).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut child = self
            .command(&socket, image, options.read_only)
            .spawn()
            .map_err(|e| ProviderError::Exposure(format!("failed to start {}: {e}", self.program)))?;
        info!("Started {} (pid {:?}) for disk {}", self.program, child.id(), disk.id);

        match self.wait_for_socket(&mut child, &socket).await {
            Ok(transport) => Ok(Box::new(NbdkitSession {
                transport,
                child,
                socket,
            })),
            Err(e) => {
                if let Err(kill) = child.kill().await {
                    debug!("Killing {}: {kill}", self.program);
                }
                Err(e)
            }
        }
    }
}

/// An NBD session that owns the server process behind it
pub struct NbdkitSession {
    transport: NbdTransport<UnixStream>,
    child: Child,
    socket: PathBuf,
}

#[async_trait]
impl BlockTransport for NbdkitSession {
    fn max_block_status_len(&self) -> u64 {
        self.transport.max_block_status_len()
    }

    async fn block_status(&mut self, offset: u64, length: u64) -> SyncResult<Vec<StatusExtent>> {
        self.transport.block_status(offset, length).await
    }

    async fn submit_read(&mut self, offset: u64, length: u32) -> SyncResult<RequestId> {
        self.transport.submit_read(offset, length).await
    }

    async fn next_completion(&mut self) -> SyncResult<ReadCompletion> {
        self.transport.next_completion().await
    }

    fn in_flight(&self) -> usize {
        self.transport.in_flight()
    }

    async fn close(&mut self) -> SyncResult<()> {
        let result = self.transport.close().await;
        if let Err(e) = self.child.kill().await {
            warn!("Failed to stop NBD server for {}: {e}", self.socket.display());
        }
        match tokio::fs::remove_file(&self.socket).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!("Failed to remove {}: {e}", self.socket.display());
            }
            _ => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::SnapshotDisk;
    use std::collections::BTreeMap;

    fn fixture(dir: &Path, data: &[u8]) -> (DiskDescriptor, SnapshotRef) {
        let path = dir.join("frozen.img");
        std::fs::write(&path, data).unwrap();
        let disk = DiskDescriptor {
            id: "6000C29a-disk/0".to_string(),
            key: 2000,
            name: "Hard disk 1".to_string(),
            size: data.len() as u64,
            path: "[ds1] web01/web01.vmdk".to_string(),
            storage_name: "ds1".to_string(),
            is_sparse: false,
        };
        let snapshot = SnapshotRef {
            id: "snap-1".to_string(),
            name: "conversion-1".to_string(),
            disks: BTreeMap::from([(
                disk.id.clone(),
                SnapshotDisk {
                    path: path.display().to_string(),
                    change_id: None,
                },
            )]),
        };
        (disk, snapshot)
    }

    fn options(dir: &Path) -> SessionOptions {
        SessionOptions {
            socket_dir: dir.join("nbd"),
            read_only: true,
        }
    }

    #[tokio::test]
    async fn test_file_exposer_reads_frozen_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (disk, snapshot) = fixture(dir.path(), b"frozen contents");

        let mut transport = FileExposer
            .expose_disk(&disk, &snapshot, &options(dir.path()))
            .await
            .unwrap();
        let id = transport.submit_read(7, 8).await.unwrap();
        let done = transport.next_completion().await.unwrap();
        assert_eq!(done.id, id);
        assert_eq!(&done.data[..], b"contents");
        transport.close().await.unwrap();

        let other = SnapshotRef {
            disks: BTreeMap::new(),
            ..snapshot
        };
        let err = FileExposer
            .expose_disk(&disk, &other, &options(dir.path()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::SnapshotNotFound(_)));
    }

    #[tokio::test]
    async fn test_nbdkit_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let (disk, snapshot) = fixture(dir.path(), b"x");
        let exposer = NbdkitExposer::new(PollBudget::new(2, 0)).with_program("/nonexistent/nbdkit");
        let err = exposer
            .expose_disk(&disk, &snapshot, &options(dir.path()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::Exposure(_)));
    }

    #[tokio::test]
    async fn test_nbdkit_server_exiting_early() {
        let dir = tempfile::tempdir().unwrap();
        let (disk, snapshot) = fixture(dir.path(), b"x");
        let exposer = NbdkitExposer::new(PollBudget::new(50, 0)).with_program("true");
        let err = exposer
            .expose_disk(&disk, &snapshot, &options(dir.path()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::Exposure(_)));
    }

    #[test]
    fn test_socket_name_is_flat() {
        assert_eq!(socket_name("6000C29a-disk/0"), "6000C29a-disk_0.sock");
    }
}
