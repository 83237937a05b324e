//! convhost incremental disk synchronization
//!
//! Turns "changed extents since the last pass" into bytes written on the
//! destination disk:
//!
//! - [`BlockStatusScanner`] splits an extent into data, zero and hole blocks
//! - [`AioPipeline`] keeps a bounded number of reads in flight against one
//!   transport session and routes completions to a write sink
//! - [`DiskSyncEngine`] runs one pass over one disk
//! - [`CheckpointStore`] persists [`MigrationState`] atomically after every
//!   mutation
//!
//! Block transports (NBD client, local file, in-memory) implement
//! [`BlockTransport`].

pub mod aio;
pub mod block_status;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod qos;
pub mod transport;

pub use aio::{AioPipeline, CompletedWrite, WriteSink};
pub use block_status::{BlockKind, BlockStatusScanner, DataBlock};
pub use checkpoint::{
    CheckpointStore, DiskSyncState, MigrationState, Phase, SyncAttempt, Throttling,
};
pub use engine::{DiskSyncEngine, PassSummary, SyncPass};
pub use error::{SyncError, SyncResult};
pub use qos::TokenBucket;
pub use transport::{
    BlockTransport, FileTransport, MemoryTransport, NbdTransport, ReadCompletion, RequestId,
    StatusExtent,
};

/// Maximum block-status query for 32-bit length protocols (2 GiB)
pub const DEFAULT_MAX_BLOCK_STATUS_LEN: u64 = 2 << 30;
