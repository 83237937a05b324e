//! One incremental pass over one disk
//!
//! The engine opens a fresh attempt in the migration state, classifies the
//! changed extents, records how many bytes must move, then copies them:
//! zero blocks are written locally, data blocks are read through the AIO
//! pipeline in bounded chunks. The state is checkpointed after every
//! completed write. The transport session is closed before returning,
//! whatever the outcome.

use crate::aio::{AioPipeline, CompletedWrite};
use crate::block_status::{BlockKind, BlockStatusScanner, DataBlock};
use crate::checkpoint::{CheckpointStore, MigrationState};
use crate::error::SyncResult;
use crate::qos::TokenBucket;
use crate::transport::BlockTransport;

use convhost_common::{ChangeExtent, SyncConfig, MIB};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inputs of one pass
#[derive(Debug, Clone, Copy)]
pub struct SyncPass<'a> {
    pub disk_id: &'a str,
    /// Local path of the destination disk
    pub destination: &'a Path,
    /// Changed extents since the last completed pass, ascending
    pub extents: &'a [ChangeExtent],
    /// Reference point this pass reaches once complete
    pub change_id: &'a str,
}

/// Outcome of a completed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub attempt: usize,
    pub to_copy: u64,
    pub copied: u64,
}

pub struct DiskSyncEngine {
    scanner: BlockStatusScanner,
    max_read_len: u32,
    max_in_flight: usize,
    throttle: Option<Arc<TokenBucket>>,
}

impl DiskSyncEngine {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            scanner: BlockStatusScanner::new(config.status_bypass_len),
            max_read_len: config.max_read_len.max(1),
            max_in_flight: config.max_in_flight,
            throttle: None,
        }
    }

    pub fn with_throttle(mut self, throttle: Option<Arc<TokenBucket>>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Run one pass. The transport is consumed and always closed.
    pub async fn run_pass(
        &self,
        state: &mut MigrationState,
        checkpoint: &CheckpointStore,
        pass: SyncPass<'_>,
        mut transport: Box<dyn BlockTransport>,
    ) -> SyncResult<PassSummary> {
        let result = self.copy(state, checkpoint, &pass, transport.as_mut()).await;
        if let Err(e) = transport.close().await {
            warn!("Closing transport for disk {} failed: {e}", pass.disk_id);
        }
        result
    }

    async fn copy(
        &self,
        state: &mut MigrationState,
        checkpoint: &CheckpointStore,
        pass: &SyncPass<'_>,
        transport: &mut dyn BlockTransport,
    ) -> SyncResult<PassSummary> {
        let disk_id = pass.disk_id;
        let attempt = state.begin_attempt(disk_id)?;
        checkpoint.persist(state).await?;

        let mut destination = Arc::new(
            tokio::fs::OpenOptions::new()
                .write(true)
                .open(pass.destination)
                .await?
                .into_std()
                .await,
        );

        let mut blocks: Vec<DataBlock> = Vec::new();
        for extent in pass.extents {
            let scanned = self.scanner.scan(transport, *extent).await?;
            blocks.extend(scanned.into_iter().filter(|b| b.kind != BlockKind::Hole));
        }

        let to_copy: u64 = blocks.iter().map(|b| b.length).sum();
        state.set_to_copy(disk_id, attempt, to_copy)?;
        checkpoint.persist(state).await?;
        info!("Copying {to_copy} B of data for disk {disk_id}");

        let mut progress = Progress {
            state,
            checkpoint,
            disk_id,
            attempt,
            copied: 0,
        };
        let mut aio = AioPipeline::new(self.max_in_flight).with_throttle(self.throttle.clone());

        for block in &blocks {
            debug!(
                "Block at offset {} length {} kind {:?}",
                block.offset, block.length, block.kind
            );
            match block.kind {
                BlockKind::Zero => {
                    let file = Arc::clone(&destination);
                    let (offset, length) = (block.offset, block.length);
                    blocking(move || write_zeros(&file, offset, length)).await?;
                    progress.record(block.length).await?;
                }
                BlockKind::Data => {
                    let mut done = 0u64;
                    while done < block.length {
                        let length = (block.length - done).min(self.max_read_len as u64) as u32;
                        let completed = aio
                            .submit(transport, &mut destination, block.offset + done, length)
                            .await?;
                        progress.record_all(&completed).await?;
                        done += length as u64;
                    }
                }
                BlockKind::Hole => {}
            }
        }

        let completed = aio.drain(transport, &mut destination).await?;
        progress.record_all(&completed).await?;
        let file = Arc::clone(&destination);
        blocking(move || file.sync_data()).await?;

        let copied = progress.copied;
        state.complete_attempt(disk_id, attempt, pass.change_id)?;
        checkpoint.persist(state).await?;

        if copied == 0 {
            info!("Nothing to copy for disk {disk_id}");
        } else {
            info!("Copied {copied} B for disk {disk_id}");
        }

        Ok(PassSummary {
            attempt,
            to_copy,
            copied,
        })
    }
}

/// Tracks `copied` for the running attempt and checkpoints every increment
struct Progress<'a> {
    state: &'a mut MigrationState,
    checkpoint: &'a CheckpointStore,
    disk_id: &'a str,
    attempt: usize,
    copied: u64,
}

impl Progress<'_> {
    async fn record(&mut self, bytes: u64) -> SyncResult<()> {
        self.copied = self.state.add_copied(self.disk_id, self.attempt, bytes)?;
        self.checkpoint.persist(self.state).await
    }

    async fn record_all(&mut self, writes: &[CompletedWrite]) -> SyncResult<()> {
        for write in writes {
            self.record(write.length).await?;
        }
        Ok(())
    }
}

async fn blocking<F>(f: F) -> std::io::Result<()>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
}

fn write_zeros(file: &File, offset: u64, length: u64) -> std::io::Result<()> {
    let zeros = vec![0u8; length.min(MIB) as usize];
    let mut written = 0u64;
    while written < length {
        let n = (length - written).min(zeros.len() as u64) as usize;
        file.write_all_at(&zeros[..n], offset + written)?;
        written += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::transport::{MemoryTransport, StatusExtent, STATE_HOLE, STATE_ZERO};
    use rand::RngCore;
    use tempfile::TempDir;

    const KIB: u64 = 1024;

    struct Fixture {
        _dir: TempDir,
        destination: std::path::PathBuf,
        checkpoint: CheckpointStore,
        state: MigrationState,
    }

    fn fixture(dest_len: usize, fill: u8) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("dest.img");
        std::fs::write(&destination, vec![fill; dest_len]).unwrap();
        let checkpoint = CheckpointStore::new(dir.path().join("run.state"));
        let mut state = MigrationState::new();
        state.track_disk("disk-1", "[ds1] vm/vm.vmdk").unwrap();
        Fixture {
            _dir: dir,
            destination,
            checkpoint,
            state,
        }
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn engine(max_read_len: u32, max_in_flight: usize) -> DiskSyncEngine {
        DiskSyncEngine::new(&SyncConfig {
            max_read_len,
            max_in_flight,
            ..SyncConfig::default()
        })
    }

    #[tokio::test]
    async fn test_all_hole_extent_copies_nothing() {
        let mut fx = fixture(2 * MIB as usize, 0xAB);
        let before = std::fs::read(&fx.destination).unwrap();
        let transport = MemoryTransport::new(random_bytes(2 * MIB as usize))
            .with_allocation(vec![StatusExtent::new(2 * MIB, STATE_HOLE | STATE_ZERO)]);
        let stats = transport.stats();

        let summary = engine(23 << 20, 2)
            .run_pass(
                &mut fx.state,
                &fx.checkpoint,
                SyncPass {
                    disk_id: "disk-1",
                    destination: &fx.destination,
                    extents: &[ChangeExtent::new(0, 2 * MIB)],
                    change_id: "52 de/1",
                },
                Box::new(transport),
            )
            .await
            .unwrap();

        assert_eq!(summary.to_copy, 0);
        assert_eq!(summary.copied, 0);
        assert_eq!(std::fs::read(&fx.destination).unwrap(), before);
        let stats = stats.lock();
        assert!(stats.reads.is_empty());
        assert!(stats.closed);
    }

    #[tokio::test]
    async fn test_zero_and_data_blocks() {
        let mut fx = fixture(5 * MIB as usize, 0xFF);
        let source = random_bytes(5 * MIB as usize);
        let transport = MemoryTransport::new(source.clone()).with_allocation(vec![
            StatusExtent::new(MIB, STATE_ZERO),
            StatusExtent::new(4 * MIB, 0),
        ]);

        let summary = engine(23 << 20, 2)
            .run_pass(
                &mut fx.state,
                &fx.checkpoint,
                SyncPass {
                    disk_id: "disk-1",
                    destination: &fx.destination,
                    extents: &[ChangeExtent::new(0, 5 * MIB)],
                    change_id: "52 de/2",
                },
                Box::new(transport),
            )
            .await
            .unwrap();

        let dest = std::fs::read(&fx.destination).unwrap();
        assert!(dest[..MIB as usize].iter().all(|b| *b == 0));
        assert_eq!(&dest[MIB as usize..], &source[MIB as usize..]);
        assert_eq!(summary.to_copy, 5 * MIB);
        assert_eq!(summary.copied, 5 * MIB);

        let persisted = CheckpointStore::load(fx.checkpoint.path()).unwrap();
        let attempt = persisted.attempt("disk-1", 0).unwrap();
        assert_eq!(attempt.to_copy, 5 * MIB);
        assert_eq!(attempt.copied, 5 * MIB);
        assert_eq!(attempt.change_id.as_deref(), Some("52 de/2"));
    }

    #[tokio::test]
    async fn test_reads_are_chunked_and_bounded() {
        let len = 300 * KIB;
        let mut fx = fixture(len as usize, 0);
        let source = random_bytes(len as usize);
        let transport = MemoryTransport::new(source.clone());
        let stats = transport.stats();

        engine(64 * 1024, 3)
            .run_pass(
                &mut fx.state,
                &fx.checkpoint,
                SyncPass {
                    disk_id: "disk-1",
                    destination: &fx.destination,
                    extents: &[ChangeExtent::new(0, 100 * KIB), ChangeExtent::new(100 * KIB, 200 * KIB)],
                    change_id: "c",
                },
                Box::new(transport),
            )
            .await
            .unwrap();

        let stats = stats.lock();
        assert!(stats.max_read_len() <= 64 * 1024);
        assert!(stats.peak_in_flight <= 3);
        let read_total: u64 = stats.reads.iter().map(|(_, l)| *l as u64).sum();
        assert_eq!(read_total, len);
        assert_eq!(std::fs::read(&fx.destination).unwrap(), source);
    }

    #[tokio::test]
    async fn test_no_extents_is_a_noop() {
        let mut fx = fixture(64 * KIB as usize, 0x5A);
        let before = std::fs::read(&fx.destination).unwrap();
        let transport = MemoryTransport::new(random_bytes(64 * KIB as usize));
        let stats = transport.stats();

        let summary = engine(23 << 20, 2)
            .run_pass(
                &mut fx.state,
                &fx.checkpoint,
                SyncPass {
                    disk_id: "disk-1",
                    destination: &fx.destination,
                    extents: &[],
                    change_id: "c",
                },
                Box::new(transport),
            )
            .await
            .unwrap();

        assert_eq!((summary.to_copy, summary.copied), (0, 0));
        assert_eq!(std::fs::read(&fx.destination).unwrap(), before);
        assert!(stats.lock().reads.is_empty());
        assert!(stats.lock().status_queries.is_empty());
    }

    #[tokio::test]
    async fn test_passes_append_attempts() {
        let mut fx = fixture(64 * KIB as usize, 0);
        let source = random_bytes(64 * KIB as usize);
        let eng = engine(23 << 20, 2);
        for (i, change_id) in ["a", "b"].iter().enumerate() {
            let summary = eng
                .run_pass(
                    &mut fx.state,
                    &fx.checkpoint,
                    SyncPass {
                        disk_id: "disk-1",
                        destination: &fx.destination,
                        extents: &[ChangeExtent::new(0, 4 * KIB)],
                        change_id,
                    },
                    Box::new(MemoryTransport::new(source.clone())),
                )
                .await
                .unwrap();
            assert_eq!(summary.attempt, i);
        }
        let disk = fx.state.disk("disk-1").unwrap();
        assert_eq!(disk.syncs.len(), 2);
        assert_eq!(disk.last_change_id(), Some("b"));
    }

    #[tokio::test]
    async fn test_read_failure_closes_session_and_keeps_attempt_open() {
        let mut fx = fixture(256 * KIB as usize, 0);
        let transport =
            MemoryTransport::new(random_bytes(256 * KIB as usize)).fail_reads_after(2);
        let stats = transport.stats();

        let err = engine(32 * 1024, 2)
            .run_pass(
                &mut fx.state,
                &fx.checkpoint,
                SyncPass {
                    disk_id: "disk-1",
                    destination: &fx.destination,
                    extents: &[ChangeExtent::new(0, 256 * KIB)],
                    change_id: "c",
                },
                Box::new(transport),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Transport(_)));
        assert!(stats.lock().closed);
        let attempt = fx.state.attempt("disk-1", 0).unwrap();
        assert_eq!(attempt.to_copy, 256 * KIB);
        assert!(attempt.copied < attempt.to_copy);
        assert!(!attempt.is_complete());
        assert_eq!(fx.state.disk("disk-1").unwrap().last_change_id(), None);
    }
}
