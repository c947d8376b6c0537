// src/node.rs
use crate::chunker::{ self, Chunk, ChunkParams, StrongHash };
use crate::config::Config;
use crate::error::{ Error, Result };
use crate::gc::GcTracker;
use crate::index::{ ChunkIndex, LocationRecord };
use crate::proto::FileId;
use crate::storage::Storage;
use std::collections::HashSet;
use std::io::ErrorKind;

/// Everything one endpoint holds locally: its files, the index over their
/// chunks, and the queue of owners waiting for garbage collection.
pub struct Node {
    pub storage: Storage,
    pub index: ChunkIndex,
    pub gc: GcTracker,
    params: ChunkParams,
    block_size: usize,
}

/// Outcome of searching the index for verified chunk bytes.
#[derive(Debug, Default)]
pub struct ChunkLookup {
    /// The verified record and the bytes read from it.
    pub found: Option<(LocationRecord, Vec<u8>)>,
    pub candidates: usize,
    /// Stale records deleted along the way.
    pub pruned: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub files: usize,
    /// Already indexed at their current mtime.
    pub skipped: usize,
    /// Vanished or failed to read during the scan.
    pub unreadable: usize,
    pub chunks: usize,
}

enum Candidate {
    Match(Vec<u8>),
    Mismatch,
    Stale(&'static str),
}

impl Node {
    pub fn new(storage: Storage, index: ChunkIndex, params: ChunkParams, block_size: usize) -> Self {
        Node {
            storage,
            index,
            gc: GcTracker::new(),
            params,
            block_size: block_size.max(1),
        }
    }

    /// Opens the store and index named by `config`. Failing to open the
    /// index is fatal for the endpoint.
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let storage = Storage::new(&config.data_dir)?;
        let index = ChunkIndex::open(config.index_path())?;
        Ok(Node::new(storage, index, config.chunking, config.session.block_size))
    }

    pub fn params(&self) -> &ChunkParams {
        &self.params
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn chunk_file(&self, id: &FileId, strong: bool) -> Result<Vec<Chunk>> {
        let path = self.storage.path_of(id)?;
        Ok(chunker::chunk_file(&path, &self.params, strong, self.block_size)?)
    }

    /// Records `chunks` of `owner` in the index. A failed insert only loses
    /// a dedup opportunity, so it is logged and skipped.
    pub fn record_chunks(&self, owner: &FileId, chunks: &[Chunk], mtime: Option<u64>) -> usize {
        let mut inserted = 0;
        for chunk in chunks.iter().filter(|c| c.length > 0) {
            let record = LocationRecord {
                owner: owner.clone(),
                offset: chunk.offset,
                length: chunk.length,
                mtime,
            };
            match self.index.insert(chunk.fingerprint, &record) {
                Ok(()) => {
                    inserted += 1;
                }
                Err(e) => log::warn!("Could not index chunk {:016x} of {}: {}", chunk.fingerprint, owner, e),
            }
        }
        inserted
    }

    /// Chunks `id` as it is now and records it as the owner's current
    /// content; older records of `id` are queued for collection.
    pub fn index_file(&self, id: &FileId) -> Result<usize> {
        let mtime = self.storage.attrs(id)?.mtime;
        let chunks = self.chunk_file(id, false)?;
        let inserted = self.record_chunks(id, &chunks, Some(mtime));
        self.gc.mark_replaced(id.clone(), mtime);
        log::debug!("Indexed {} ({} chunks)", id, inserted);
        Ok(inserted)
    }

    /// Indexes every file in the store that is not already indexed at its
    /// current mtime.
    pub fn scan(&self) -> Result<ScanReport> {
        let ids = self.storage.list_files()?;
        let report = self.scan_files(ids)?;
        log::info!(
            "Scanned {}: {} files indexed ({} chunks), {} unchanged, {} unreadable",
            self.storage.root().display(),
            report.files,
            report.chunks,
            report.skipped,
            report.unreadable
        );
        Ok(report)
    }

    // Files that vanish or fail to read mid-scan are logged and left out.
    fn scan_files(&self, ids: Vec<FileId>) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        for id in ids {
            match self.scan_one(&id) {
                Ok(Some(chunks)) => {
                    report.files += 1;
                    report.chunks += chunks;
                }
                Ok(None) => {
                    report.skipped += 1;
                }
                Err(e) => {
                    log::warn!("Not indexing {}: {}", id, e);
                    report.unreadable += 1;
                }
            }
        }
        self.index.sync()?;
        Ok(report)
    }

    // `None` when the file is already indexed at its current mtime.
    fn scan_one(&self, id: &FileId) -> Result<Option<usize>> {
        let mtime = self.storage.attrs(id)?.mtime;
        let chunks = self.chunk_file(id, false)?;
        if self.is_indexed(id, &chunks, mtime)? {
            return Ok(None);
        }
        let inserted = self.record_chunks(id, &chunks, Some(mtime));
        self.gc.mark_replaced(id.clone(), mtime);
        Ok(Some(inserted))
    }

    // A file counts as indexed when its first chunk is recorded for it at this mtime.
    fn is_indexed(&self, id: &FileId, chunks: &[Chunk], mtime: u64) -> Result<bool> {
        let Some(first) = chunks.iter().find(|c| c.length > 0) else {
            return Ok(true);
        };
        if let Some(mut cursor) = self.index.open_cursor(first.fingerprint)? {
            loop {
                if cursor.get().is_some_and(|r| &r.owner == id && r.offset == first.offset && r.mtime == Some(mtime)) {
                    return Ok(true);
                }
                if !cursor.advance()? {
                    break;
                }
            }
        }
        Ok(false)
    }

    /// Deletes a local file and queues its records for collection.
    pub fn remove_file(&self, id: &FileId) -> Result<()> {
        self.storage.remove(id)?;
        self.gc.mark_removed(id.clone());
        Ok(())
    }

    /// Queues every owner in the index whose file is gone (removed) or has
    /// changed since its records were made (replaced).
    pub fn audit(&self) -> Result<usize> {
        let mut seen = HashSet::new();
        if let Some(mut cursor) = self.index.open_cursor_all()? {
            loop {
                seen.extend(cursor.get().map(|r| r.owner.clone()));
                if !cursor.advance()? {
                    break;
                }
            }
        }
        let queued = seen.len();
        for owner in seen {
            match self.storage.attrs(&owner) {
                Ok(attrs) => self.gc.mark_replaced(owner, attrs.mtime),
                Err(Error::Io(e)) if e.kind() != ErrorKind::NotFound => {
                    log::warn!("Cannot stat {}: {}", owner, e);
                }
                Err(_) => self.gc.mark_removed(owner),
            }
        }
        Ok(queued)
    }

    /// Looks for `length` bytes with this fingerprint and strong hash among
    /// the indexed chunks. A fingerprint match is only a hint: every
    /// candidate is read back and re-hashed before it is returned. Records
    /// whose owner is gone, shorter, or modified since are deleted.
    pub fn find_chunk(&self, fingerprint: u64, strong_hash: &StrongHash, length: u32) -> Result<ChunkLookup> {
        let mut lookup = ChunkLookup::default();
        let Some(mut cursor) = self.index.open_cursor(fingerprint)? else {
            return Ok(lookup);
        };
        loop {
            let Some(record) = cursor.get().cloned() else {
                if !cursor.advance()? {
                    break;
                }
                continue;
            };
            lookup.candidates += 1;
            match self.check_candidate(&record, strong_hash, length) {
                Candidate::Match(data) => {
                    log::debug!("Chunk {:016x} found in {} at {}", fingerprint, record.owner, record.offset);
                    lookup.found = Some((record, data));
                    break;
                }
                Candidate::Mismatch => {}
                Candidate::Stale(reason) => {
                    log::debug!(
                        "Dropping stale record {:016x} -> {}@{}: {}",
                        fingerprint,
                        record.owner,
                        record.offset,
                        reason
                    );
                    cursor.delete_current()?;
                    lookup.pruned += 1;
                }
            }
            if !cursor.advance()? {
                break;
            }
        }
        Ok(lookup)
    }

    fn check_candidate(&self, record: &LocationRecord, strong_hash: &StrongHash, length: u32) -> Candidate {
        if record.length != length {
            return Candidate::Mismatch;
        }
        if let Some(mtime) = record.mtime {
            match self.storage.attrs(&record.owner) {
                Ok(attrs) if attrs.mtime != mtime => {
                    return Candidate::Stale("owner modified");
                }
                Ok(_) => {}
                Err(_) => {
                    return Candidate::Stale("owner unreadable");
                }
            }
        }
        let data = match self.storage.read_exact_range(&record.owner, record.offset, length as usize) {
            Ok(data) => data,
            Err(Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                return Candidate::Stale("owner too short");
            }
            Err(_) => {
                return Candidate::Stale("owner unreadable");
            }
        };
        if StrongHash::of(&data) == *strong_hash {
            Candidate::Match(data)
        } else {
            Candidate::Mismatch
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> FileId {
        FileId::new(s).unwrap()
    }

    fn node(dir: &std::path::Path) -> Node {
        let storage = Storage::new(dir.join("data")).unwrap();
        let index = ChunkIndex::temporary().unwrap();
        Node::new(storage, index, ChunkParams::default(), 4096)
    }

    #[test]
    fn test_find_chunk_verifies_content() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(dir.path());
        node.storage.put(&id("a.txt"), b"hello world").unwrap();
        node.index_file(&id("a.txt")).unwrap();

        let chunks = node.chunk_file(&id("a.txt"), true).unwrap();
        let c = chunks[0];
        let hash = c.strong_hash.unwrap();
        let lookup = node.find_chunk(c.fingerprint, &hash, c.length).unwrap();
        let (record, data) = lookup.found.expect("verified chunk");
        assert_eq!(record.owner, id("a.txt"));
        assert_eq!(data, b"hello world");

        // Right fingerprint, wrong strong hash: a collision, not a hit.
        let lookup = node.find_chunk(c.fingerprint, &StrongHash::of(b"other"), c.length).unwrap();
        assert!(lookup.found.is_none());
        assert_eq!(lookup.candidates, 1);
        assert_eq!(lookup.pruned, 0);
    }

    #[test]
    fn test_find_chunk_prunes_vanished_owner() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(dir.path());
        node.storage.put(&id("gone.txt"), b"hello world").unwrap();
        node.index_file(&id("gone.txt")).unwrap();
        let c = node.chunk_file(&id("gone.txt"), true).unwrap()[0];
        node.storage.remove(&id("gone.txt")).unwrap();

        let lookup = node.find_chunk(c.fingerprint, &c.strong_hash.unwrap(), c.length).unwrap();
        assert!(lookup.found.is_none());
        assert_eq!(lookup.pruned, 1);
        assert!(node.index.open_cursor(c.fingerprint).unwrap().is_none());
    }

    #[test]
    fn test_scan_skips_unchanged_files() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(dir.path());
        node.storage.put(&id("one"), b"first file").unwrap();
        node.storage.put(&id("nested/two"), b"second file").unwrap();

        let report = node.scan().unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(node.index.len(), 2);

        let report = node.scan().unwrap();
        assert_eq!(report.files, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(node.index.len(), 2);
    }

    #[test]
    fn test_scan_continues_past_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(dir.path());
        node.storage.put(&id("a"), b"first file").unwrap();
        node.storage.put(&id("b"), b"doomed").unwrap();
        node.storage.put(&id("c"), b"third file").unwrap();

        let ids = node.storage.list_files().unwrap();
        node.storage.remove(&id("b")).unwrap();
        let report = node.scan_files(ids).unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.unreadable, 1);
        assert_eq!(node.index.len(), 2);
        assert_eq!(node.gc.pending(), 2);
    }

    #[test]
    fn test_audit_queues_removed_owners() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(dir.path());
        node.storage.put(&id("stay"), b"stay here").unwrap();
        node.storage.put(&id("leave"), b"leave now").unwrap();
        node.scan().unwrap();
        node.gc.sweep(&node.index, None).unwrap();

        std::fs::remove_file(node.storage.path_of(&id("leave")).unwrap()).unwrap();
        assert_eq!(node.audit().unwrap(), 2);
        let report = node.gc.sweep(&node.index, None).unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(node.index.len(), 1);
    }
}
