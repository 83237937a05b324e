//! Bounded asynchronous read pipeline
//!
//! Keeps up to `max_in_flight` reads outstanding on one transport session.
//! Every submitted read gets a slot in the pending table keyed by its request
//! id; a completion looks up its own slot, writes the bytes to the sink at the
//! slot's offset and frees it. All polling happens on the caller's task.

use crate::error::{SyncError, SyncResult};
use crate::qos::TokenBucket;
use crate::transport::{BlockTransport, RequestId};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tracing::trace;

/// Destination for completed reads
#[async_trait]
pub trait WriteSink: Send {
    async fn write_at(&mut self, offset: u64, data: Bytes) -> std::io::Result<()>;
}

/// Positional writes on the blocking pool
#[async_trait]
impl WriteSink for Arc<File> {
    async fn write_at(&mut self, offset: u64, data: Bytes) -> std::io::Result<()> {
        let file = Arc::clone(self);
        tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(std::io::Error::other)?
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRead {
    offset: u64,
    length: u32,
}

/// A read that landed in the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedWrite {
    pub offset: u64,
    pub length: u64,
}

pub struct AioPipeline {
    max_in_flight: usize,
    pending: HashMap<RequestId, PendingRead>,
    throttle: Option<Arc<TokenBucket>>,
}

impl AioPipeline {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            pending: HashMap::new(),
            throttle: None,
        }
    }

    /// Pace submissions by read size
    pub fn with_throttle(mut self, throttle: Option<Arc<TokenBucket>>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Issue a read of `[offset, offset + length)`.
    ///
    /// Waits for completions while the pipeline is full; the writes they
    /// produced are returned.
    pub async fn submit<T, W>(
        &mut self,
        transport: &mut T,
        sink: &mut W,
        offset: u64,
        length: u32,
    ) -> SyncResult<Vec<CompletedWrite>>
    where
        T: BlockTransport + ?Sized,
        W: WriteSink + ?Sized,
    {
        let mut done = Vec::new();
        while self.pending.len() >= self.max_in_flight {
            done.push(self.complete_one(transport, sink).await?);
        }

        if let Some(throttle) = &self.throttle {
            throttle.acquire(length as u64).await;
        }
        let id = transport.submit_read(offset, length).await?;
        self.pending.insert(id, PendingRead { offset, length });
        trace!("aio submit id={id} offset={offset} length={length}");
        Ok(done)
    }

    /// Wait for every outstanding read
    pub async fn drain<T, W>(&mut self, transport: &mut T, sink: &mut W) -> SyncResult<Vec<CompletedWrite>>
    where
        T: BlockTransport + ?Sized,
        W: WriteSink + ?Sized,
    {
        let mut done = Vec::with_capacity(self.pending.len());
        while !self.pending.is_empty() {
            done.push(self.complete_one(transport, sink).await?);
        }
        Ok(done)
    }

    async fn complete_one<T, W>(&mut self, transport: &mut T, sink: &mut W) -> SyncResult<CompletedWrite>
    where
        T: BlockTransport + ?Sized,
        W: WriteSink + ?Sized,
    {
        let completion = transport.next_completion().await?;
        let slot = self.pending.remove(&completion.id).ok_or_else(|| {
            SyncError::Protocol(format!("completion for unknown request {}", completion.id))
        })?;
        if completion.data.len() != slot.length as usize {
            return Err(SyncError::Protocol(format!(
                "read at offset {} returned {} bytes, expected {}",
                slot.offset,
                completion.data.len(),
                slot.length
            )));
        }
        sink.write_at(slot.offset, completion.data).await?;
        Ok(CompletedWrite {
            offset: slot.offset,
            length: slot.length as u64,
        })
    }
}
