//! In-memory transport
//!
//! Serves a byte buffer with a configurable allocation map. Reads complete
//! newest-first so callers never rely on submission order. Every session
//! records what it was asked to do in a shared [`MemoryStats`], which stays
//! readable after the transport has been boxed and consumed.

use super::{BlockTransport, ReadCompletion, RequestId, StatusExtent};
use crate::error::{SyncError, SyncResult};
use crate::DEFAULT_MAX_BLOCK_STATUS_LEN;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// Observations from one session
#[derive(Debug, Default)]
pub struct MemoryStats {
    pub reads: Vec<(u64, u32)>,
    pub status_queries: Vec<(u64, u64)>,
    pub peak_in_flight: usize,
    pub closed: bool,
}

impl MemoryStats {
    pub fn max_read_len(&self) -> u32 {
        self.reads.iter().map(|(_, len)| *len).max().unwrap_or(0)
    }
}

pub struct MemoryTransport {
    data: Bytes,
    /// Allocation map from offset 0; `None` reports everything as data
    allocation: Option<Vec<StatusExtent>>,
    /// Fixed reply for every status query, for misbehaving-server cases
    status_reply: Option<Vec<StatusExtent>>,
    max_status_len: u64,
    fail_read_after: Option<usize>,
    next_id: RequestId,
    pending: Vec<(RequestId, u64, u32)>,
    stats: Arc<Mutex<MemoryStats>>,
}

impl MemoryTransport {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            allocation: None,
            status_reply: None,
            max_status_len: DEFAULT_MAX_BLOCK_STATUS_LEN,
            fail_read_after: None,
            next_id: 1,
            pending: Vec::new(),
            stats: Arc::new(Mutex::new(MemoryStats::default())),
        }
    }

    pub fn with_allocation(mut self, allocation: Vec<StatusExtent>) -> Self {
        self.allocation = Some(allocation);
        self
    }

    pub fn with_status_reply(mut self, reply: Vec<StatusExtent>) -> Self {
        self.status_reply = Some(reply);
        self
    }

    pub fn with_max_status_len(mut self, len: u64) -> Self {
        self.max_status_len = len;
        self
    }

    /// Fail every read submitted after the first `n`
    pub fn fail_reads_after(mut self, n: usize) -> Self {
        self.fail_read_after = Some(n);
        self
    }

    pub fn with_stats(mut self, stats: Arc<Mutex<MemoryStats>>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<Mutex<MemoryStats>> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl BlockTransport for MemoryTransport {
    fn max_block_status_len(&self) -> u64 {
        self.max_status_len
    }

    async fn block_status(&mut self, offset: u64, length: u64) -> SyncResult<Vec<StatusExtent>> {
        self.stats.lock().status_queries.push((offset, length));
        if let Some(reply) = &self.status_reply {
            return Ok(reply.clone());
        }
        let Some(allocation) = &self.allocation else {
            return Ok(vec![StatusExtent::new(length, 0)]);
        };

        let end = offset + length;
        let mut out = Vec::new();
        let mut pos = 0u64;
        for extent in allocation {
            let extent_end = pos + extent.length;
            if extent_end > offset && pos < end {
                let from = pos.max(offset);
                let to = extent_end.min(end);
                out.push(StatusExtent::new(to - from, extent.flags));
            }
            pos = extent_end;
            if pos >= end {
                break;
            }
        }
        Ok(out)
    }

    async fn submit_read(&mut self, offset: u64, length: u32) -> SyncResult<RequestId> {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push((id, offset, length));

        let mut stats = self.stats.lock();
        stats.reads.push((offset, length));
        stats.peak_in_flight = stats.peak_in_flight.max(self.pending.len());
        Ok(id)
    }

    async fn next_completion(&mut self) -> SyncResult<ReadCompletion> {
        let Some((id, offset, length)) = self.pending.pop() else {
            return Err(SyncError::Transport("no reads in flight".into()));
        };
        if let Some(limit) = self.fail_read_after {
            if id as usize > limit {
                return Err(SyncError::Transport(format!("injected failure at offset {offset}")));
            }
        }
        let start = offset as usize;
        let end = start + length as usize;
        if end > self.data.len() {
            return Err(SyncError::Transport(format!(
                "read {offset}+{length} beyond end {}",
                self.data.len()
            )));
        }
        Ok(ReadCompletion {
            id,
            data: self.data.slice(start..end),
        })
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.pending.clear();
        self.stats.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocation_is_clipped_to_query() {
        let mut t = MemoryTransport::new(vec![0u8; 100]).with_allocation(vec![
            StatusExtent::new(40, 3),
            StatusExtent::new(60, 0),
        ]);
        let status = t.block_status(30, 20).await.unwrap();
        assert_eq!(status, vec![StatusExtent::new(10, 3), StatusExtent::new(10, 0)]);
    }

    #[tokio::test]
    async fn test_completions_are_newest_first() {
        let mut t = MemoryTransport::new((0..=255u8).collect::<Vec<_>>());
        let a = t.submit_read(0, 4).await.unwrap();
        let b = t.submit_read(4, 4).await.unwrap();
        assert_eq!(t.next_completion().await.unwrap().id, b);
        let first = t.next_completion().await.unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.data.as_ref(), &[0, 1, 2, 3]);
        assert_eq!(t.stats().lock().peak_in_flight, 2);
    }
}
