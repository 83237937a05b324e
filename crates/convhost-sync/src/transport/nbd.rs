//! NBD client transport
//!
//! Fixed-newstyle handshake, structured replies and the `base:allocation`
//! metadata context. Reads are pipelined: every command carries a handle and
//! replies are matched against a pending table, so completions may arrive in
//! any order.

#![allow(clippy::cast_possible_truncation)]

use super::{BlockTransport, ReadCompletion, RequestId, StatusExtent};
use crate::error::{SyncError, SyncResult};
use crate::DEFAULT_MAX_BLOCK_STATUS_LEN;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace};

// ── NBD protocol constants ────────────────────────────────────────────────────

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

// Handshake flags
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

// Option IDs
const NBD_OPT_GO: u32 = 7;
const NBD_OPT_STRUCTURED_REPLY: u32 = 8;
const NBD_OPT_SET_META_CONTEXT: u32 = 10;

// Option reply types
const NBD_REP_ACK: u32 = 1;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_META_CONTEXT: u32 = 4;
const NBD_REP_FLAG_ERROR: u32 = 0x8000_0000;

// Info types
const NBD_INFO_EXPORT: u16 = 0;

// Commands
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_BLOCK_STATUS: u16 = 7;

// Structured reply chunk types
const NBD_REPLY_FLAG_DONE: u16 = 0x0001;
const NBD_REPLY_TYPE_NONE: u16 = 0;
const NBD_REPLY_TYPE_OFFSET_DATA: u16 = 1;
const NBD_REPLY_TYPE_OFFSET_HOLE: u16 = 2;
const NBD_REPLY_TYPE_BLOCK_STATUS: u16 = 5;
const NBD_REPLY_TYPE_ERROR_BIT: u16 = 0x8000;

const BASE_ALLOCATION: &str = "base:allocation";

/// State of one command awaiting its final reply chunk
#[derive(Debug)]
enum Pending {
    Read {
        offset: u64,
        buf: BytesMut,
        error: Option<String>,
    },
    BlockStatus {
        extents: Vec<StatusExtent>,
        error: Option<String>,
    },
}

/// NBD session over any byte stream
pub struct NbdTransport<S> {
    stream: S,
    export_size: u64,
    context_id: u32,
    next_handle: u64,
    pending: HashMap<u64, Pending>,
    reads_in_flight: usize,
    ready: VecDeque<ReadCompletion>,
    closed: bool,
}

impl NbdTransport<UnixStream> {
    /// Connect to an NBD server listening on a Unix socket
    pub async fn connect_unix(socket: impl AsRef<Path>, export_name: &str) -> SyncResult<Self> {
        let stream = UnixStream::connect(socket.as_ref()).await?;
        Self::handshake(stream, export_name).await
    }
}

impl<S> NbdTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Negotiate an export on an already-connected stream
    pub async fn handshake(mut stream: S, export_name: &str) -> SyncResult<Self> {
        // ── Greeting ──────────────────────────────────────────────────────────
        let magic = stream.read_u64().await?;
        if magic != NBD_MAGIC {
            return Err(SyncError::Protocol(format!("bad server magic: {magic:#x}")));
        }
        let opt_magic = stream.read_u64().await?;
        if opt_magic != NBD_IHAVEOPT {
            return Err(SyncError::Protocol("server does not speak newstyle".into()));
        }
        let server_flags = stream.read_u16().await?;
        if server_flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
            return Err(SyncError::Protocol("server lacks fixed newstyle".into()));
        }
        let client_flags = NBD_FLAG_FIXED_NEWSTYLE | (server_flags & NBD_FLAG_NO_ZEROES);
        stream.write_u32(client_flags as u32).await?;

        let mut session = Self {
            stream,
            export_size: 0,
            context_id: 0,
            next_handle: 1,
            pending: HashMap::new(),
            reads_in_flight: 0,
            ready: VecDeque::new(),
            closed: false,
        };

        // ── Option negotiation ────────────────────────────────────────────────
        session.send_option(NBD_OPT_STRUCTURED_REPLY, &[]).await?;
        loop {
            let (reply, data) = session.read_option_reply(NBD_OPT_STRUCTURED_REPLY).await?;
            match reply {
                NBD_REP_ACK => break,
                r if r & NBD_REP_FLAG_ERROR != 0 => {
                    return Err(SyncError::Protocol(format!(
                        "server refused structured replies: {}",
                        String::from_utf8_lossy(&data)
                    )));
                }
                _ => {}
            }
        }

        let mut meta = BytesMut::new();
        meta.put_u32(export_name.len() as u32);
        meta.put_slice(export_name.as_bytes());
        meta.put_u32(1);
        meta.put_u32(BASE_ALLOCATION.len() as u32);
        meta.put_slice(BASE_ALLOCATION.as_bytes());
        session.send_option(NBD_OPT_SET_META_CONTEXT, &meta).await?;
        let mut context = None;
        loop {
            let (reply, mut data) = session.read_option_reply(NBD_OPT_SET_META_CONTEXT).await?;
            match reply {
                NBD_REP_ACK => break,
                NBD_REP_META_CONTEXT if data.len() >= 4 => {
                    let id = data.get_u32();
                    if data.as_ref() == BASE_ALLOCATION.as_bytes() {
                        context = Some(id);
                    }
                }
                r if r & NBD_REP_FLAG_ERROR != 0 => {
                    return Err(SyncError::Protocol(format!(
                        "server refused {BASE_ALLOCATION}: {}",
                        String::from_utf8_lossy(&data)
                    )));
                }
                _ => {}
            }
        }
        session.context_id = context.ok_or_else(|| {
            SyncError::Protocol(format!("server did not select {BASE_ALLOCATION}"))
        })?;

        let mut go = BytesMut::new();
        go.put_u32(export_name.len() as u32);
        go.put_slice(export_name.as_bytes());
        go.put_u16(0);
        session.send_option(NBD_OPT_GO, &go).await?;
        loop {
            let (reply, mut data) = session.read_option_reply(NBD_OPT_GO).await?;
            match reply {
                NBD_REP_ACK => break,
                NBD_REP_INFO if data.len() >= 2 => {
                    if data.get_u16() == NBD_INFO_EXPORT && data.len() >= 10 {
                        session.export_size = data.get_u64();
                    }
                }
                r if r & NBD_REP_FLAG_ERROR != 0 => {
                    return Err(SyncError::Transport(format!(
                        "export '{export_name}' unavailable: {}",
                        String::from_utf8_lossy(&data)
                    )));
                }
                _ => {}
            }
        }

        debug!(
            "NBD: connected to export '{export_name}' ({} bytes)",
            session.export_size
        );
        Ok(session)
    }

    /// Size of the negotiated export
    pub fn export_size(&self) -> u64 {
        self.export_size
    }

    async fn send_option(&mut self, option: u32, data: &[u8]) -> SyncResult<()> {
        let mut buf = BytesMut::with_capacity(16 + data.len());
        buf.put_u64(NBD_IHAVEOPT);
        buf.put_u32(option);
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_option_reply(&mut self, option: u32) -> SyncResult<(u32, Bytes)> {
        let magic = self.stream.read_u64().await?;
        if magic != NBD_OPTION_REPLY_MAGIC {
            return Err(SyncError::Protocol(format!("bad option reply magic: {magic:#x}")));
        }
        let replied_to = self.stream.read_u32().await?;
        if replied_to != option {
            return Err(SyncError::Protocol(format!(
                "reply for option {replied_to} while negotiating {option}"
            )));
        }
        let reply = self.stream.read_u32().await?;
        let len = self.stream.read_u32().await?;
        let mut data = vec![0u8; len as usize];
        self.stream.read_exact(&mut data).await?;
        Ok((reply, Bytes::from(data)))
    }

    async fn send_command(&mut self, command: u16, offset: u64, length: u32) -> SyncResult<u64> {
        let handle = self.next_handle;
        self.next_handle += 1;

        let mut buf = BytesMut::with_capacity(28);
        buf.put_u32(NBD_REQUEST_MAGIC);
        buf.put_u16(0);
        buf.put_u16(command);
        buf.put_u64(handle);
        buf.put_u64(offset);
        buf.put_u32(length);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(handle)
    }

    /// Consume one reply (or reply chunk). Returns the handle when the
    /// command it belongs to is complete.
    async fn read_reply(&mut self) -> SyncResult<Option<u64>> {
        let magic = self.stream.read_u32().await?;
        match magic {
            NBD_SIMPLE_REPLY_MAGIC => {
                let error = self.stream.read_u32().await?;
                let handle = self.stream.read_u64().await?;
                let pending = self.pending.get_mut(&handle).ok_or_else(|| {
                    SyncError::Protocol(format!("reply for unknown handle {handle}"))
                })?;
                match pending {
                    Pending::Read { buf, error: slot, .. } => {
                        if error != 0 {
                            *slot = Some(format!("server error {error}"));
                        } else {
                            self.stream.read_exact(buf).await?;
                        }
                    }
                    Pending::BlockStatus { error: slot, .. } => {
                        *slot = Some(if error != 0 {
                            format!("server error {error}")
                        } else {
                            "block status answered with a simple reply".to_string()
                        });
                    }
                }
                Ok(Some(handle))
            }
            NBD_STRUCTURED_REPLY_MAGIC => {
                let flags = self.stream.read_u16().await?;
                let kind = self.stream.read_u16().await?;
                let handle = self.stream.read_u64().await?;
                let len = self.stream.read_u32().await?;
                let mut payload = vec![0u8; len as usize];
                self.stream.read_exact(&mut payload).await?;

                let context_id = self.context_id;
                let pending = self.pending.get_mut(&handle).ok_or_else(|| {
                    SyncError::Protocol(format!("reply for unknown handle {handle}"))
                })?;
                apply_chunk(pending, kind, Bytes::from(payload), context_id)?;

                Ok((flags & NBD_REPLY_FLAG_DONE != 0).then_some(handle))
            }
            other => Err(SyncError::Protocol(format!("bad reply magic: {other:#x}"))),
        }
    }

    /// Move a finished read from the pending table to the ready queue
    fn finish_read(&mut self, handle: u64) -> SyncResult<()> {
        match self.pending.remove(&handle) {
            Some(Pending::Read { buf, error, offset }) => {
                self.reads_in_flight -= 1;
                if let Some(e) = error {
                    return Err(SyncError::Transport(format!(
                        "read at offset {offset} failed: {e}"
                    )));
                }
                self.ready.push_back(ReadCompletion {
                    id: handle,
                    data: buf.freeze(),
                });
                Ok(())
            }
            Some(other) => {
                self.pending.insert(handle, other);
                Err(SyncError::Protocol(format!(
                    "handle {handle} finished outside its waiter"
                )))
            }
            None => Err(SyncError::Protocol(format!("unknown handle {handle}"))),
        }
    }
}

fn apply_chunk(pending: &mut Pending, kind: u16, mut payload: Bytes, context_id: u32) -> SyncResult<()> {
    if kind & NBD_REPLY_TYPE_ERROR_BIT != 0 {
        if payload.len() < 6 {
            return Err(SyncError::Protocol("short error chunk".into()));
        }
        let code = payload.get_u32();
        let msg_len = (payload.get_u16() as usize).min(payload.len());
        let message = format!(
            "server error {code}: {}",
            String::from_utf8_lossy(&payload[..msg_len])
        );
        match pending {
            Pending::Read { error, .. } | Pending::BlockStatus { error, .. } => {
                error.get_or_insert(message);
            }
        }
        return Ok(());
    }

    match (kind, pending) {
        (NBD_REPLY_TYPE_NONE, _) => Ok(()),
        (NBD_REPLY_TYPE_OFFSET_DATA, Pending::Read { offset, buf, .. }) => {
            if payload.len() < 8 {
                return Err(SyncError::Protocol("short data chunk".into()));
            }
            let chunk_offset = payload.get_u64();
            let start = chunk_range(*offset, buf.len(), chunk_offset, payload.len() as u64)?;
            buf[start..start + payload.len()].copy_from_slice(&payload);
            Ok(())
        }
        (NBD_REPLY_TYPE_OFFSET_HOLE, Pending::Read { offset, buf, .. }) => {
            if payload.len() < 12 {
                return Err(SyncError::Protocol("short hole chunk".into()));
            }
            let chunk_offset = payload.get_u64();
            let hole_len = payload.get_u32() as u64;
            // The buffer starts zeroed; only validate the range
            chunk_range(*offset, buf.len(), chunk_offset, hole_len)?;
            Ok(())
        }
        (NBD_REPLY_TYPE_BLOCK_STATUS, Pending::BlockStatus { extents, .. }) => {
            if payload.len() < 4 || (payload.len() - 4) % 8 != 0 {
                return Err(SyncError::Protocol("malformed block status chunk".into()));
            }
            let id = payload.get_u32();
            if id != context_id {
                return Err(SyncError::Protocol(format!("unexpected metadata context {id}")));
            }
            while payload.has_remaining() {
                let length = payload.get_u32() as u64;
                let flags = payload.get_u32();
                extents.push(StatusExtent::new(length, flags));
            }
            Ok(())
        }
        (kind, _) => Err(SyncError::Protocol(format!(
            "unexpected reply chunk type {kind}"
        ))),
    }
}

/// Position of a chunk inside a read buffer, rejecting out-of-range chunks
fn chunk_range(req_offset: u64, req_len: usize, chunk_offset: u64, chunk_len: u64) -> SyncResult<usize> {
    let end = chunk_offset.checked_add(chunk_len);
    match end {
        Some(end) if chunk_offset >= req_offset && end <= req_offset + req_len as u64 => {
            Ok((chunk_offset - req_offset) as usize)
        }
        _ => Err(SyncError::Protocol(format!(
            "chunk {chunk_offset}+{chunk_len} outside request {req_offset}+{req_len}"
        ))),
    }
}

#[async_trait]
impl<S> BlockTransport for NbdTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn max_block_status_len(&self) -> u64 {
        DEFAULT_MAX_BLOCK_STATUS_LEN
    }

    async fn block_status(&mut self, offset: u64, length: u64) -> SyncResult<Vec<StatusExtent>> {
        let length = length.min(DEFAULT_MAX_BLOCK_STATUS_LEN) as u32;
        let handle = self.send_command(NBD_CMD_BLOCK_STATUS, offset, length).await?;
        self.pending.insert(
            handle,
            Pending::BlockStatus {
                extents: Vec::new(),
                error: None,
            },
        );
        trace!("NBD: block_status handle={handle} offset={offset} length={length}");

        loop {
            let Some(done) = self.read_reply().await? else {
                continue;
            };
            if done != handle {
                self.finish_read(done)?;
                continue;
            }
            return match self.pending.remove(&handle) {
                Some(Pending::BlockStatus { error: Some(e), .. }) => Err(SyncError::Transport(
                    format!("block status at offset {offset} failed: {e}"),
                )),
                Some(Pending::BlockStatus { extents, .. }) => Ok(extents),
                _ => Err(SyncError::Protocol(format!("lost handle {handle}"))),
            };
        }
    }

    async fn submit_read(&mut self, offset: u64, length: u32) -> SyncResult<RequestId> {
        let handle = self.send_command(NBD_CMD_READ, offset, length).await?;
        let buf = BytesMut::zeroed(length as usize);
        self.pending.insert(
            handle,
            Pending::Read {
                offset,
                buf,
                error: None,
            },
        );
        self.reads_in_flight += 1;
        Ok(handle)
    }

    async fn next_completion(&mut self) -> SyncResult<ReadCompletion> {
        loop {
            if let Some(completion) = self.ready.pop_front() {
                return Ok(completion);
            }
            if self.reads_in_flight == 0 {
                return Err(SyncError::Transport("no reads in flight".into()));
            }
            if let Some(done) = self.read_reply().await? {
                self.finish_read(done)?;
            }
        }
    }

    fn in_flight(&self) -> usize {
        self.reads_in_flight + self.ready.len()
    }

    async fn close(&mut self) -> SyncResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send_command(NBD_CMD_DISC, 0, 0).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl<S> Drop for NbdTransport<S> {
    fn drop(&mut self) {
        if !self.closed && !self.pending.is_empty() {
            debug!("NBD: session dropped with {} commands pending", self.pending.len());
        }
    }
}
