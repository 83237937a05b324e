//! Local file transport
//!
//! Reads a disk image directly with positional reads on the blocking pool.
//! Block status comes from `SEEK_DATA`/`SEEK_HOLE` on Linux; elsewhere the
//! whole file reports as data.

use super::{BlockTransport, ReadCompletion, RequestId, StatusExtent, STATE_HOLE, STATE_ZERO};
use crate::error::{SyncError, SyncResult};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct FileTransport {
    path: PathBuf,
    file: Arc<File>,
    size: u64,
    next_id: RequestId,
    in_flight: VecDeque<(RequestId, JoinHandle<std::io::Result<Vec<u8>>>)>,
}

impl FileTransport {
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        debug!("File transport: opened {} ({size} bytes)", path.display());
        Ok(Self {
            path,
            file: Arc::new(file),
            size,
            next_id: 1,
            in_flight: VecDeque::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl BlockTransport for FileTransport {
    async fn block_status(&mut self, offset: u64, length: u64) -> SyncResult<Vec<StatusExtent>> {
        let length = length.min(self.max_block_status_len());
        if offset >= self.size {
            return Ok(vec![StatusExtent::new(length, STATE_HOLE | STATE_ZERO)]);
        }
        let end = (offset + length).min(self.size);
        let mut extents = allocation_map(&self.file, offset, end)?;
        if offset + length > end {
            extents.push(StatusExtent::new(offset + length - end, STATE_HOLE | STATE_ZERO));
        }
        Ok(extents)
    }

    async fn submit_read(&mut self, offset: u64, length: u32) -> SyncResult<RequestId> {
        let id = self.next_id;
        self.next_id += 1;
        let file = Arc::clone(&self.file);
        let handle = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; length as usize];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        });
        self.in_flight.push_back((id, handle));
        Ok(id)
    }

    async fn next_completion(&mut self) -> SyncResult<ReadCompletion> {
        let Some((id, handle)) = self.in_flight.pop_front() else {
            return Err(SyncError::Transport("no reads in flight".into()));
        };
        let data = handle
            .await
            .map_err(|e| SyncError::Transport(format!("read task for {}: {e}", self.path.display())))??;
        Ok(ReadCompletion {
            id,
            data: Bytes::from(data),
        })
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn close(&mut self) -> SyncResult<()> {
        // Let outstanding reads finish so none outlives the session
        while let Some((_, handle)) = self.in_flight.pop_front() {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn allocation_map(file: &File, start: u64, end: u64) -> SyncResult<Vec<StatusExtent>> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let seek = |pos: u64, whence: libc::c_int| -> std::io::Result<Option<u64>> {
        // SAFETY: fd is a valid descriptor owned by `file` for this call
        let r = unsafe { libc::lseek(fd, pos as libc::off_t, whence) };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(r as u64))
    };

    let mut extents = Vec::new();
    let mut pos = start;
    while pos < end {
        let data = match seek(pos, libc::SEEK_DATA) {
            Ok(d) => d,
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                // Filesystem without hole reporting
                extents.push(StatusExtent::new(end - pos, 0));
                break;
            }
            Err(e) => return Err(e.into()),
        };
        match data {
            None => {
                extents.push(StatusExtent::new(end - pos, STATE_HOLE | STATE_ZERO));
                break;
            }
            Some(d) if d > pos => {
                let hole_end = d.min(end);
                extents.push(StatusExtent::new(hole_end - pos, STATE_HOLE | STATE_ZERO));
                pos = hole_end;
            }
            Some(_) => {
                let hole = seek(pos, libc::SEEK_HOLE)?.unwrap_or(end);
                let data_end = hole.min(end);
                extents.push(StatusExtent::new(data_end - pos, 0));
                pos = data_end;
            }
        }
    }
    Ok(extents)
}

#[cfg(not(target_os = "linux"))]
fn allocation_map(_file: &File, start: u64, end: u64) -> SyncResult<Vec<StatusExtent>> {
    Ok(vec![StatusExtent::new(end - start, 0)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_and_covers_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut f = File::create(&path).unwrap();
        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 256) as u8).collect();
        f.write_all(&payload).unwrap();
        f.set_len(1 << 20).unwrap();
        drop(f);

        let mut t = FileTransport::open(&path).unwrap();
        assert_eq!(t.size(), 1 << 20);

        // Whatever the filesystem reports, the reply covers the query exactly
        let status = t.block_status(0, 2 << 20).await.unwrap();
        let covered: u64 = status.iter().map(|e| e.length).sum();
        assert_eq!(covered, 2 << 20);
        assert_eq!(status[0].flags & STATE_HOLE, 0);
        assert_eq!(status.last().unwrap().flags, STATE_HOLE | STATE_ZERO);

        let a = t.submit_read(0, 4096).await.unwrap();
        let b = t.submit_read(4096, 4096).await.unwrap();
        assert_eq!(t.in_flight(), 2);
        let first = t.next_completion().await.unwrap();
        let second = t.next_completion().await.unwrap();
        assert_eq!((first.id, second.id), (a, b));
        assert_eq!(first.data.as_ref(), &payload[..4096]);
        assert_eq!(second.data.as_ref(), &payload[4096..]);
        t.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.img");
        std::fs::write(&path, [1u8; 512]).unwrap();
        let mut t = FileTransport::open(&path).unwrap();
        t.submit_read(256, 512).await.unwrap();
        assert!(matches!(t.next_completion().await, Err(SyncError::Io(_))));
    }
}
