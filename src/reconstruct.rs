// src/reconstruct.rs

//! Materializing a remote file locally from chunks already held here.
//!
//! The remote describes its file with GETFP; every described chunk is
//! looked up in the local index and, once its bytes re-hash to the
//! described strong hash, copied from the local file holding it. Anything
//! not found or not verified is fetched with plain READs.

use crate::chunker::{ Chunk, StrongHash };
use crate::config::SessionConfig;
use crate::error::{ Error, Result };
use crate::node::Node;
use crate::proto::{ with_retry, ChunkDescriptor, FileAttr, FileId, Peer };

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub chunks_reused: usize,
    pub chunks_fetched: usize,
    pub bytes_reused: u64,
    pub bytes_fetched: u64,
    /// Stale index records deleted while looking for candidates.
    pub stale_pruned: usize,
    pub getfp_calls: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub attrs: FileAttr,
    pub stats: ReadStats,
}

/// Where a filled range ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillProgress {
    /// End of the last chunk placed; the next range must start here.
    pub end: u64,
    pub eof: bool,
}

pub struct DedupReadReconstructor<'a, P: Peer> {
    peer: &'a P,
    node: &'a Node,
    config: &'a SessionConfig,
    remote: FileId,
    local: FileId,
    chunks: Vec<Chunk>,
    stats: ReadStats,
}

impl<'a, P: Peer> DedupReadReconstructor<'a, P> {
    pub fn new(peer: &'a P, node: &'a Node, config: &'a SessionConfig, remote: FileId, local: FileId) -> Self {
        DedupReadReconstructor {
            peer,
            node,
            config,
            remote,
            local,
            chunks: Vec::new(),
            stats: ReadStats::default(),
        }
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// Replaces the local file with the remote file's whole content. The
    /// content is assembled in a staging file beside the local one and
    /// renamed over it only once complete; on failure the local file is
    /// left untouched.
    pub async fn materialize(&mut self) -> Result<ReadOutcome> {
        let mode = self.node.storage.attrs(&self.local).map(|a| a.mode).unwrap_or(0o644);
        let staging = self.node.storage.create_temp(&self.local, mode)?;

        let attrs = match self.assemble(&staging).await {
            Ok(attrs) => attrs,
            Err(e) => {
                log::error!("Reading {} into {} failed: {}", self.remote, self.local, e);
                if let Err(e) = self.node.storage.remove(&staging) {
                    log::warn!("Could not remove staging file {}: {}", staging, e);
                }
                return Err(e);
            }
        };

        // Local chunks are recorded only once the content they describe
        // is in place.
        self.node.record_chunks(&self.local, &self.chunks, Some(attrs.mtime));
        self.node.gc.mark_replaced(self.local.clone(), attrs.mtime);
        if let Err(e) = self.node.index.sync() {
            log::warn!("Index sync failed: {}", e);
        }

        log::info!(
            "Read {} -> {}: {} chunks reused ({} bytes), {} fetched ({} bytes)",
            self.remote,
            self.local,
            self.stats.chunks_reused,
            self.stats.bytes_reused,
            self.stats.chunks_fetched,
            self.stats.bytes_fetched
        );
        Ok(ReadOutcome { attrs, stats: self.stats })
    }

    async fn assemble(&mut self, staging: &FileId) -> Result<FileAttr> {
        let progress = self.fill_range(staging, 0, u64::MAX).await?;
        if !progress.eof {
            return Err(Error::Aborted(format!("GETFP for {} ended before end of file", self.remote)));
        }
        self.node.storage.set_len(staging, progress.end)?;
        self.node.storage.rename(staging, &self.local)
    }

    /// Writes the remote bytes in `[offset, offset + max_len)` into `dest`
    /// at the same offsets. `offset` must be 0 or the `end` of an earlier
    /// fill. The range is extended to the next chunk boundary.
    pub async fn fill_range(&mut self, dest: &FileId, offset: u64, max_len: u64) -> Result<FillProgress> {
        let retries = self.config.rpc_retries;
        let limit = offset.saturating_add(max_len);
        let mut progress = FillProgress { end: offset, eof: false };

        while progress.end < limit {
            let at = progress.end;
            let reply = with_retry("GETFP", retries, || self.peer.getfp(&self.remote, at, limit - at)).await?;
            self.stats.getfp_calls += 1;

            for descriptor in &reply.descriptors {
                if descriptor.offset != progress.end {
                    return Err(
                        Error::Aborted(
                            format!(
                                "GETFP for {} skipped from {} to {}",
                                self.remote,
                                progress.end,
                                descriptor.offset
                            )
                        )
                    );
                }
                if descriptor.length > 0 {
                    self.place(dest, descriptor).await?;
                }
                progress.end = descriptor.end();
            }

            if reply.eof {
                progress.eof = true;
                break;
            }
            if reply.descriptors.is_empty() {
                return Err(Error::Aborted(format!("GETFP for {} made no progress at {}", self.remote, at)));
            }
        }
        Ok(progress)
    }

    // Resolves one chunk: verified local copy if possible, remote READ
    // otherwise.
    async fn place(&mut self, dest: &FileId, descriptor: &ChunkDescriptor) -> Result<()> {
        let lookup = self.node.find_chunk(descriptor.fingerprint, &descriptor.strong_hash, descriptor.length);
        let found = match lookup {
            Ok(lookup) => {
                self.stats.stale_pruned += lookup.pruned;
                lookup.found
            }
            Err(e) => {
                log::warn!("Index lookup for {:016x} failed: {}", descriptor.fingerprint, e);
                None
            }
        };

        let bytes = u64::from(descriptor.length);
        match found {
            Some((record, data)) => {
                log::debug!(
                    "Chunk {}@{} reused from {}@{}",
                    self.remote,
                    descriptor.offset,
                    record.owner,
                    record.offset
                );
                self.node.storage.write_at(dest, descriptor.offset, &data)?;
                self.stats.chunks_reused += 1;
                self.stats.bytes_reused += bytes;
            }
            None => {
                let data = self.fetch(descriptor).await?;
                self.node.storage.write_at(dest, descriptor.offset, &data)?;
                self.stats.chunks_fetched += 1;
                self.stats.bytes_fetched += bytes;
            }
        }

        self.chunks.push(Chunk {
            offset: descriptor.offset,
            length: descriptor.length,
            fingerprint: descriptor.fingerprint,
            strong_hash: Some(descriptor.strong_hash),
        });
        Ok(())
    }

    async fn fetch(&self, descriptor: &ChunkDescriptor) -> Result<Vec<u8>> {
        let length = descriptor.length as usize;
        let mut data = Vec::with_capacity(length);
        while data.len() < length {
            let offset = descriptor.offset + (data.len() as u64);
            let count = (length - data.len()).min(self.config.read_size as usize) as u32;
            let reply = with_retry("READ", self.config.rpc_retries, || self.peer.read(&self.remote, offset, count)).await?;
            if reply.data.is_empty() {
                return Err(Error::Aborted(format!("{} ended at {} inside a described chunk", self.remote, offset)));
            }
            data.extend_from_slice(&reply.data);
        }
        data.truncate(length);

        // The remote file may have changed since GETFP described it.
        if StrongHash::of(&data) != descriptor.strong_hash {
            return Err(Error::Aborted(format!("{} changed while being read at {}", self.remote, descriptor.offset)));
        }
        log::debug!("Chunk {}@{} fetched ({} bytes)", self.remote, descriptor.offset, length);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkParams;
    use crate::index::{ ChunkIndex, LocationRecord };
    use crate::server::Server;
    use crate::storage::Storage;

    fn id(s: &str) -> FileId {
        FileId::new(s).unwrap()
    }

    fn node(dir: &std::path::Path) -> Node {
        let storage = Storage::new(dir).unwrap();
        Node::new(storage, ChunkIndex::temporary().unwrap(), ChunkParams::with_average_size(256), 1024)
    }

    fn lcg_data(seed: u32, len: usize) -> Vec<u8> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1103515245).wrapping_add(12345);
                (x >> 16) as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fetches_everything_into_empty_node() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionConfig { read_size: 100, getfp_max_chunks: 3, ..Default::default() };
        let remote = Server::new(node(&dir.path().join("remote")), session);
        let data = lcg_data(7, 5000);
        remote.node().storage.put(&id("doc"), &data).unwrap();

        let local = node(&dir.path().join("local"));
        let mut reader = DedupReadReconstructor::new(&remote, &local, &session, id("doc"), id("copy"));
        let outcome = reader.materialize().await.unwrap();

        assert_eq!(local.storage.get(&id("copy")).unwrap(), data);
        assert_eq!(outcome.attrs.size, 5000);
        assert_eq!(outcome.stats.chunks_reused, 0);
        assert_eq!(outcome.stats.bytes_fetched, 5000);
        assert!(outcome.stats.getfp_calls > 1);
        // The copy is now indexed under its own identity.
        assert_eq!(local.index.len(), outcome.stats.chunks_fetched);
    }

    #[tokio::test]
    async fn test_forced_collision_is_never_copied() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionConfig::default();
        let remote = Server::new(node(&dir.path().join("remote")), session);
        remote.node().storage.put(&id("f"), b"the real bytes").unwrap();
        let chunk = remote.node().chunk_file(&id("f"), true).unwrap()[0];

        // A local record claims the same fingerprint for different bytes.
        let local = node(&dir.path().join("local"));
        local.storage.put(&id("impostor"), b"some fake bytes").unwrap();
        let mtime = local.storage.attrs(&id("impostor")).unwrap().mtime;
        local.index
            .insert(chunk.fingerprint, &LocationRecord {
                owner: id("impostor"),
                offset: 0,
                length: chunk.length,
                mtime: Some(mtime),
            })
            .unwrap();

        let mut reader = DedupReadReconstructor::new(&remote, &local, &session, id("f"), id("f"));
        let outcome = reader.materialize().await.unwrap();
        assert_eq!(local.storage.get(&id("f")).unwrap(), b"the real bytes");
        assert_eq!(outcome.stats.chunks_reused, 0);
        assert_eq!(outcome.stats.chunks_fetched, 1);
    }

    #[tokio::test]
    async fn test_failure_leaves_local_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionConfig::default();
        let remote = Server::new(node(&dir.path().join("remote")), session);
        let local = node(&dir.path().join("local"));
        local.storage.put(&id("f"), b"previous").unwrap();

        let mut reader = DedupReadReconstructor::new(&remote, &local, &session, id("missing"), id("f"));
        assert!(reader.materialize().await.is_err());
        assert_eq!(local.storage.get(&id("f")).unwrap(), b"previous");
        // No staging file left behind.
        assert_eq!(std::fs::read_dir(local.storage.root()).unwrap().count(), 1);
    }
}
