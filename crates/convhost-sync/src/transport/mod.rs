//! Block transport sessions
//!
//! A transport is one open session to a source disk. It answers bounded
//! block-status queries and serves asynchronous reads that complete in any
//! order. A session is not shared between tasks: the caller owns it for one
//! pass and polls it for completions.

pub mod file;
pub mod memory;
pub mod nbd;

pub use file::FileTransport;
pub use memory::MemoryTransport;
pub use nbd::NbdTransport;

use crate::error::SyncResult;
use crate::DEFAULT_MAX_BLOCK_STATUS_LEN;

use async_trait::async_trait;
use bytes::Bytes;

/// Range is not allocated
pub const STATE_HOLE: u32 = 1 << 0;
/// Range reads as zeros
pub const STATE_ZERO: u32 = 1 << 1;

/// Identifier of one in-flight read
pub type RequestId = u64;

/// One `(length, flags)` pair of a block-status reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusExtent {
    pub length: u64,
    pub flags: u32,
}

impl StatusExtent {
    pub fn new(length: u64, flags: u32) -> Self {
        Self { length, flags }
    }
}

/// A finished read
#[derive(Debug, Clone)]
pub struct ReadCompletion {
    pub id: RequestId,
    pub data: Bytes,
}

#[async_trait]
pub trait BlockTransport: Send {
    /// Largest range one block-status query may cover
    fn max_block_status_len(&self) -> u64 {
        DEFAULT_MAX_BLOCK_STATUS_LEN
    }

    /// Classify `[offset, offset + length)`. The reply starts at `offset` and
    /// may cover less (or, at the end, more) than requested.
    async fn block_status(&mut self, offset: u64, length: u64) -> SyncResult<Vec<StatusExtent>>;

    /// Queue a read and return its id without waiting for the data
    async fn submit_read(&mut self, offset: u64, length: u32) -> SyncResult<RequestId>;

    /// Wait for the next finished read. Errors when nothing is in flight.
    async fn next_completion(&mut self) -> SyncResult<ReadCompletion>;

    /// Number of reads submitted but not yet returned by `next_completion`
    fn in_flight(&self) -> usize;

    /// End the session
    async fn close(&mut self) -> SyncResult<()>;
}

#[async_trait]
impl<T: BlockTransport + ?Sized> BlockTransport for Box<T> {
    fn max_block_status_len(&self) -> u64 {
        (**self).max_block_status_len()
    }

    async fn block_status(&mut self, offset: u64, length: u64) -> SyncResult<Vec<StatusExtent>> {
        (**self).block_status(offset, length).await
    }

    async fn submit_read(&mut self, offset: u64, length: u32) -> SyncResult<RequestId> {
        (**self).submit_read(offset, length).await
    }

    async fn next_completion(&mut self) -> SyncResult<ReadCompletion> {
        (**self).next_completion().await
    }

    fn in_flight(&self) -> usize {
        (**self).in_flight()
    }

    async fn close(&mut self) -> SyncResult<()> {
        (**self).close().await
    }
}
