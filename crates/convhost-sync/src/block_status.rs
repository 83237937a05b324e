//! Block-status scanning
//!
//! Partitions a changed extent into data, zero and hole blocks by querying the
//! transport in bounded sub-queries. Small extents skip the round trip and are
//! copied as data.

use crate::error::{SyncError, SyncResult};
use crate::transport::{BlockTransport, STATE_HOLE, STATE_ZERO};

use convhost_common::{ChangeExtent, MIB};
use tracing::trace;

/// What the destination needs for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Read from the source and write
    Data,
    /// Write zeros without reading
    Zero,
    /// Skip
    Hole,
}

impl BlockKind {
    /// Decode `base:allocation` flags
    pub fn from_flags(flags: u32) -> SyncResult<Self> {
        if flags & !(STATE_HOLE | STATE_ZERO) != 0 {
            return Err(SyncError::Protocol(format!(
                "unexpected block status flags {flags:#x}"
            )));
        }
        Ok(if flags & STATE_HOLE != 0 {
            BlockKind::Hole
        } else if flags & STATE_ZERO != 0 {
            BlockKind::Zero
        } else {
            BlockKind::Data
        })
    }
}

/// A classified sub-range of an extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlock {
    pub offset: u64,
    pub length: u64,
    pub kind: BlockKind,
}

impl DataBlock {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockStatusScanner {
    bypass_len: u64,
}

impl Default for BlockStatusScanner {
    fn default() -> Self {
        Self { bypass_len: MIB }
    }
}

impl BlockStatusScanner {
    pub fn new(bypass_len: u64) -> Self {
        Self { bypass_len }
    }

    /// Classify every byte of `extent`.
    ///
    /// The result is sorted, contiguous and covers the extent exactly.
    pub async fn scan<T>(&self, transport: &mut T, extent: ChangeExtent) -> SyncResult<Vec<DataBlock>>
    where
        T: BlockTransport + ?Sized,
    {
        if extent.length < self.bypass_len {
            return Ok(vec![DataBlock {
                offset: extent.start,
                length: extent.length,
                kind: BlockKind::Data,
            }]);
        }

        let max_query = transport.max_block_status_len().max(1);
        let end = extent.end();
        let mut blocks = Vec::new();
        let mut pos = extent.start;

        while pos < end {
            let query = (end - pos).min(max_query);
            trace!("block_status offset={pos} length={query}");
            let reply = transport.block_status(pos, query).await?;
            if reply.is_empty() {
                return Err(SyncError::Protocol(format!(
                    "block status at offset {pos} returned no extents"
                )));
            }

            for entry in reply {
                if entry.length == 0 {
                    return Err(SyncError::Protocol(format!(
                        "block status at offset {pos} made no progress"
                    )));
                }
                let kind = BlockKind::from_flags(entry.flags)?;
                let length = entry.length.min(end - pos);
                blocks.push(DataBlock {
                    offset: pos,
                    length,
                    kind,
                });
                pos += length;
                if pos >= end {
                    break;
                }
            }
        }

        Ok(blocks)
    }
}
