// src/write_session.rs

//! Sending one file to a peer without resending chunks it already holds.
//!
//! `Created -> Writing -> Finalizing -> Committed | Aborted`
//!
//! The peer first creates a temp file (MKTMPFILE). The local copy is then
//! chunked block by block; each chunk is offered with CONDWRITE and, if the
//! peer cannot produce it from its own data, sent with plain WRITEs. At most
//! `max_outstanding` chunks are in flight and they may complete in any
//! order. Once the input is exhausted and every byte is acknowledged, the
//! temp file replaces the target (COMMITTMP). Any failure past the retry
//! budget aborts the session and removes the temp file (ABORTTMP).

use crate::chunker::{ Chunk, Chunker };
use crate::config::SessionConfig;
use crate::error::{ Error, Result };
use crate::index::LocationRecord;
use crate::node::Node;
use crate::proto::{ with_retry, CondWriteArgs, CreateAttrs, FileAttr, FileId, Peer, RpcError };
use crate::storage::read_range_from;
use futures::stream::{ FuturesUnordered, StreamExt };
use std::fs::File;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Writing,
    Finalizing,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub chunks: usize,
    pub condwrite_hits: usize,
    pub plain_writes: usize,
    /// Bytes the peer copied from its own data.
    pub bytes_deduped: u64,
    /// Bytes sent over the wire in WRITEs.
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Attributes of the target as committed by the peer.
    pub attrs: FileAttr,
    pub stats: WriteStats,
}

// Completion of one chunk.
struct ChunkAck {
    bytes: u64,
    deduped: bool,
    writes: usize,
}

pub struct DedupWriteSession<'a, P: Peer> {
    peer: &'a P,
    node: &'a Node,
    config: &'a SessionConfig,
    /// Local file holding the content.
    source: FileId,
    /// Identity of the file at the peer.
    target: FileId,
    temp: Option<FileId>,
    state: SessionState,
    chunker: Chunker,
    bytes_consumed: u64,
    bytes_acked: u64,
    chunks_acked: usize,
    end_of_input: bool,
    stats: WriteStats,
}

impl<'a, P: Peer> DedupWriteSession<'a, P> {
    pub fn new(peer: &'a P, node: &'a Node, config: &'a SessionConfig, source: FileId, target: FileId) -> Self {
        DedupWriteSession {
            peer,
            node,
            config,
            source,
            target,
            temp: None,
            state: SessionState::Created,
            chunker: Chunker::with_params(node.params(), true),
            bytes_consumed: 0,
            bytes_acked: 0,
            chunks_acked: 0,
            end_of_input: false,
            stats: WriteStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    /// Drives the session to `Committed` or `Aborted`.
    pub async fn run(&mut self, attrs: CreateAttrs) -> Result<WriteOutcome> {
        debug_assert_eq!(self.state, SessionState::Created);
        let retries = self.config.rpc_retries;

        // 1. MKTMPFILE
        let temp = match with_retry("MKTMPFILE", retries, || self.peer.mktmpfile(&self.target, &attrs)).await {
            Ok(temp) => temp,
            Err(e) => {
                self.state = SessionState::Aborted;
                log::error!("Could not create temp file for {}: {}", self.target, e);
                return Err(e.into());
            }
        };
        self.temp = Some(temp.clone());
        self.state = SessionState::Writing;

        // 2. CONDWRITE / WRITE every chunk
        if let Err(e) = self.transfer(&temp).await {
            self.abort(&temp, &e).await;
            return Err(e);
        }

        // 3. COMMITTMP
        self.state = SessionState::Finalizing;
        debug_assert!(self.end_of_input, "commit before end of input");
        debug_assert_eq!(self.bytes_acked, self.bytes_consumed, "commit with unacknowledged bytes");
        debug_assert_eq!(self.chunks_acked, self.chunker.chunks().len());

        let committed = match with_retry("COMMITTMP", retries, || self.peer.committmp(&temp, &self.target)).await {
            Ok(attrs) => attrs,
            Err(e) => {
                let e = Error::from(e);
                self.abort(&temp, &e).await;
                return Err(e);
            }
        };
        self.state = SessionState::Committed;
        self.record_committed();

        log::info!(
            "Wrote {} -> {}: {} chunks, {} deduplicated ({} bytes), {} bytes sent",
            self.source,
            self.target,
            self.stats.chunks,
            self.stats.condwrite_hits,
            self.stats.bytes_deduped,
            self.stats.bytes_sent
        );
        Ok(WriteOutcome { attrs: committed, stats: self.stats })
    }

    async fn transfer(&mut self, temp: &FileId) -> Result<()> {
        let source = self.node.storage.open(&self.source)?;
        let peer = self.peer;
        let retries = self.config.rpc_retries;
        let window = self.config.max_outstanding.max(1);
        let block = self.node.block_size();

        let mut in_flight = FuturesUnordered::new();
        let mut next = 0;
        loop {
            // Keep the window full: dispatch ready chunks, chunk more input
            // when none are ready.
            while in_flight.len() < window {
                if let Some(&chunk) = self.chunker.chunks().get(next) {
                    next += 1;
                    self.stats.chunks += 1;
                    if chunk.length == 0 {
                        self.chunks_acked += 1;
                        continue;
                    }
                    self.record_provisional(&chunk);
                    in_flight.push(send_chunk(peer, &source, temp, chunk, retries));
                    continue;
                }
                if self.end_of_input {
                    break;
                }
                let data = read_range_from(&source, self.bytes_consumed, block)?;
                if data.is_empty() {
                    self.chunker.finish();
                    self.end_of_input = true;
                } else {
                    self.chunker.feed(&data);
                    self.bytes_consumed += data.len() as u64;
                }
            }

            match in_flight.next().await {
                None => {
                    break;
                }
                Some(Ok(ack)) => {
                    self.bytes_acked += ack.bytes;
                    self.chunks_acked += 1;
                    if ack.deduped {
                        self.stats.condwrite_hits += 1;
                        self.stats.bytes_deduped += ack.bytes;
                    } else {
                        self.stats.plain_writes += ack.writes;
                        self.stats.bytes_sent += ack.bytes;
                    }
                }
                Some(Err(e)) => {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    // Inserted before the chunk is acknowledged; the record may end up
    // pointing at content that was never committed, which verification at
    // lookup time tolerates.
    fn record_provisional(&self, chunk: &Chunk) {
        let record = LocationRecord {
            owner: self.source.clone(),
            offset: chunk.offset,
            length: chunk.length,
            mtime: None,
        };
        if let Err(e) = self.node.index.insert(chunk.fingerprint, &record) {
            log::warn!("Could not index chunk {:016x}: {}", chunk.fingerprint, e);
        }
    }

    fn record_committed(&self) {
        let mtime = match self.node.storage.attrs(&self.source) {
            Ok(attrs) => attrs.mtime,
            Err(e) => {
                log::warn!("Cannot stat {} after commit: {}", self.source, e);
                return;
            }
        };
        self.node.record_chunks(&self.source, self.chunker.chunks(), Some(mtime));
        self.node.gc.mark_replaced(self.source.clone(), mtime);
        if let Err(e) = self.node.index.sync() {
            log::warn!("Index sync failed: {}", e);
        }
    }

    // Dropping the in-flight requests happened when `transfer` returned, so
    // nothing issued by this session completes after this point.
    async fn abort(&mut self, temp: &FileId, cause: &Error) {
        self.state = SessionState::Aborted;
        log::error!("Write of {} -> {} aborted: {}", self.source, self.target, cause);
        if let Err(e) = with_retry("ABORTTMP", self.config.rpc_retries, || self.peer.aborttmp(temp)).await {
            log::warn!("ABORTTMP {} failed: {}", temp, e);
        }
    }
}

/// Gets one chunk into the peer's temp file: CONDWRITE first, plain WRITEs
/// when the peer does not hold the chunk or CONDWRITE keeps failing.
async fn send_chunk<P: Peer>(peer: &P, source: &File, temp: &FileId, chunk: Chunk, retries: u32) -> Result<ChunkAck> {
    let length = chunk.length;
    if let Some(strong_hash) = chunk.strong_hash {
        let args = CondWriteArgs {
            file: temp.clone(),
            offset: chunk.offset,
            length,
            fingerprint: chunk.fingerprint,
            strong_hash,
        };
        match with_retry("CONDWRITE", retries, || peer.condwrite(&args)).await {
            Ok(n) if n == length => {
                return Ok(ChunkAck { bytes: u64::from(n), deduped: true, writes: 0 });
            }
            Ok(n) => log::debug!("CONDWRITE at {} copied {} of {} bytes, resending", chunk.offset, n, length),
            Err(RpcError::FingerprintNotFound) => {
                log::debug!("Chunk {:016x} at {} not held by peer", chunk.fingerprint, chunk.offset);
            }
            Err(RpcError::Transport(e)) => {
                log::warn!("CONDWRITE at {} failed ({}), falling back to WRITE", chunk.offset, e);
            }
            Err(e) => {
                return Err(e.into());
            }
        }
    }

    let data = read_range_from(source, chunk.offset, length as usize)?;
    if data.len() != length as usize {
        return Err(
            Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "source file shrank while being written"))
        );
    }
    let mut written = 0;
    let mut writes = 0;
    while written < data.len() {
        let offset = chunk.offset + (written as u64);
        let rest = &data[written..];
        let n = with_retry("WRITE", retries, || peer.write(temp, offset, rest)).await?;
        if n == 0 {
            return Err(Error::Rpc(RpcError::Errno(libc::EIO)));
        }
        written += n as usize;
        writes += 1;
    }
    Ok(ChunkAck { bytes: written as u64, deduped: false, writes })
}
