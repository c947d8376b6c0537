// src/server.rs
use crate::chunker::Chunker;
use crate::config::SessionConfig;
use crate::node::Node;
use crate::proto::{
    ChunkDescriptor,
    CondWriteArgs,
    CreateAttrs,
    FileAttr,
    FileId,
    GetFpReply,
    Peer,
    ReadReply,
    Request,
    Response,
    RpcError,
    RpcResult,
};
use crate::storage::read_range_from;
use std::collections::HashMap;
use std::sync::{ Mutex, MutexGuard };

// Temp file bookkeeping: what a temp file will become.
struct TempEntry {
    target: FileId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub temps_created: u64,
    pub condwrite_hits: u64,
    pub condwrite_misses: u64,
    pub writes: u64,
    pub bytes_copied: u64,
    pub bytes_written: u64,
    pub commits: u64,
    pub aborts: u64,
    pub getfp_calls: u64,
    pub reads: u64,
    pub bytes_read: u64,
}

/// Answers the dedup protocol for one endpoint.
pub struct Server {
    node: Node,
    session: SessionConfig,
    temps: Mutex<HashMap<FileId, TempEntry>>,
    stats: Mutex<ServerStats>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Server {
    pub fn new(node: Node, session: SessionConfig) -> Self {
        Server {
            node,
            session,
            temps: Mutex::new(HashMap::new()),
            stats: Mutex::new(ServerStats::default()),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn stats(&self) -> ServerStats {
        *relock(&self.stats)
    }

    /// Temp files created and neither committed nor aborted yet.
    pub fn open_temps(&self) -> usize {
        relock(&self.temps).len()
    }

    /// Maps a decoded request to its reply.
    pub fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::MkTmpFile { target, attrs } => self.mktmpfile_now(&target, &attrs).into(),
            Request::CondWrite(args) => self.condwrite_now(&args).into(),
            Request::Write { file, offset, data } => self.write_now(&file, offset, &data).into(),
            Request::CommitTmp { temp, target } => self.committmp_now(&temp, &target).into(),
            Request::AbortTmp { temp } => self.aborttmp_now(&temp).into(),
            Request::GetFp { file, offset, max_len } => self.getfp_now(&file, offset, max_len).into(),
            Request::Read { file, offset, count } => self.read_now(&file, offset, count).into(),
        }
    }

    // =======================================================================
    // HANDLERS
    // =======================================================================

    fn mktmpfile_now(&self, target: &FileId, attrs: &CreateAttrs) -> RpcResult<FileId> {
        let temp = self.node.storage.create_temp(target, attrs.mode).map_err(|e| {
            log::warn!("MKTMPFILE for {} failed: {}", target, e);
            RpcError::from(e)
        })?;
        relock(&self.temps).insert(temp.clone(), TempEntry { target: target.clone() });
        relock(&self.stats).temps_created += 1;
        log::debug!("MKTMPFILE {} -> {}", target, temp);
        Ok(temp)
    }

    fn condwrite_now(&self, args: &CondWriteArgs) -> RpcResult<u32> {
        if args.length == 0 {
            return Ok(0);
        }
        let lookup = match self.node.find_chunk(args.fingerprint, &args.strong_hash, args.length) {
            Ok(lookup) => lookup,
            Err(e) => {
                log::warn!("Index lookup for {:016x} failed: {}", args.fingerprint, e);
                Default::default()
            }
        };
        let Some((source, data)) = lookup.found else {
            relock(&self.stats).condwrite_misses += 1;
            return Err(RpcError::FingerprintNotFound);
        };
        self.node.storage.write_at(&args.file, args.offset, &data)?;
        {
            let mut stats = relock(&self.stats);
            stats.condwrite_hits += 1;
            stats.bytes_copied += u64::from(args.length);
        }
        log::debug!(
            "CONDWRITE {}@{}: copied {} bytes from {}@{}",
            args.file,
            args.offset,
            args.length,
            source.owner,
            source.offset
        );
        Ok(args.length)
    }

    fn write_now(&self, file: &FileId, offset: u64, data: &[u8]) -> RpcResult<u32> {
        let len = u32::try_from(data.len()).map_err(|_| RpcError::Errno(libc::EFBIG))?;
        self.node.storage.write_at(file, offset, data)?;
        {
            let mut stats = relock(&self.stats);
            stats.writes += 1;
            stats.bytes_written += u64::from(len);
        }
        // In-place writes to a regular file outdate its index records.
        if !relock(&self.temps).contains_key(file) {
            let attrs = self.node.storage.attrs(file)?;
            self.node.gc.mark_replaced(file.clone(), attrs.mtime);
        }
        Ok(len)
    }

    fn committmp_now(&self, temp: &FileId, target: &FileId) -> RpcResult<FileAttr> {
        {
            let temps = relock(&self.temps);
            match temps.get(temp) {
                None => {
                    return Err(RpcError::Errno(libc::ESTALE));
                }
                Some(entry) if &entry.target != target => {
                    return Err(RpcError::Errno(libc::EINVAL));
                }
                Some(_) => {}
            }
        }

        let attrs = self.node.storage.rename(temp, target).map_err(|e| {
            log::warn!("COMMITTMP {} -> {} failed: {}", temp, target, e);
            RpcError::from(e)
        })?;
        relock(&self.temps).remove(temp);
        relock(&self.stats).commits += 1;

        // The new content is authoritative from here on; a failure to index
        // it only costs future dedup hits.
        if let Err(e) = self.node.index_file(target) {
            log::warn!("Could not index committed {}: {}", target, e);
        }
        if let Err(e) = self.node.index.sync() {
            log::warn!("Index sync after commit failed: {}", e);
        }
        log::info!("Committed {} ({} bytes)", target, attrs.size);
        Ok(attrs)
    }

    fn aborttmp_now(&self, temp: &FileId) -> RpcResult<()> {
        // Only files this server handed out as temps may be removed here.
        if relock(&self.temps).remove(temp).is_none() {
            log::debug!("ABORTTMP for unknown temp {}", temp);
            return Ok(());
        }
        match self.node.storage.remove(temp) {
            Ok(()) => {}
            Err(crate::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove temp {}: {}", temp, e),
        }
        relock(&self.stats).aborts += 1;
        log::info!("Aborted temp {}", temp);
        Ok(())
    }

    /// Chunks `file` from `offset` (which must be a chunk boundary of an
    /// earlier reply, or 0) and describes up to `getfp_max_chunks` chunks.
    fn getfp_now(&self, file: &FileId, offset: u64, max_len: u64) -> RpcResult<GetFpReply> {
        let source = self.node.storage.open(file)?;
        let mut chunker = Chunker::with_params(self.node.params(), true);
        let max_chunks = self.session.getfp_max_chunks;
        let block = self.node.block_size();

        let mut eof = false;
        loop {
            let enough = chunker.chunks().len() >= max_chunks
                || (chunker.bytes_consumed() >= max_len && !chunker.chunks().is_empty());
            if enough {
                break;
            }
            let data = read_range_from(&source, offset + chunker.bytes_consumed(), block)?;
            if data.is_empty() {
                chunker.finish();
                eof = true;
                break;
            }
            chunker.feed(&data);
        }

        let mut chunks = chunker.into_chunks();
        if chunks.len() > max_chunks {
            chunks.truncate(max_chunks);
            eof = false;
        }
        let descriptors: Vec<ChunkDescriptor> = chunks
            .iter()
            .filter_map(ChunkDescriptor::from_chunk)
            .map(|mut d| {
                d.offset += offset;
                d
            })
            .collect();

        relock(&self.stats).getfp_calls += 1;
        log::debug!("GETFP {}@{}: {} descriptors, eof={}", file, offset, descriptors.len(), eof);
        Ok(GetFpReply { descriptors, eof })
    }

    fn read_now(&self, file: &FileId, offset: u64, count: u32) -> RpcResult<ReadReply> {
        let source = self.node.storage.open(file)?;
        let size = source.metadata()?.len();
        let count = count.min(self.session.read_size) as usize;
        let data = read_range_from(&source, offset, count)?;
        let eof = offset + (data.len() as u64) >= size;
        {
            let mut stats = relock(&self.stats);
            stats.reads += 1;
            stats.bytes_read += data.len() as u64;
        }
        Ok(ReadReply { data, eof })
    }
}

impl Peer for Server {
    async fn mktmpfile(&self, target: &FileId, attrs: &CreateAttrs) -> RpcResult<FileId> {
        self.mktmpfile_now(target, attrs)
    }

    async fn condwrite(&self, args: &CondWriteArgs) -> RpcResult<u32> {
        self.condwrite_now(args)
    }

    async fn write(&self, file: &FileId, offset: u64, data: &[u8]) -> RpcResult<u32> {
        self.write_now(file, offset, data)
    }

    async fn committmp(&self, temp: &FileId, target: &FileId) -> RpcResult<FileAttr> {
        self.committmp_now(temp, target)
    }

    async fn aborttmp(&self, temp: &FileId) -> RpcResult<()> {
        self.aborttmp_now(temp)
    }

    async fn getfp(&self, file: &FileId, offset: u64, max_len: u64) -> RpcResult<GetFpReply> {
        self.getfp_now(file, offset, max_len)
    }

    async fn read(&self, file: &FileId, offset: u64, count: u32) -> RpcResult<ReadReply> {
        self.read_now(file, offset, count)
    }
}
