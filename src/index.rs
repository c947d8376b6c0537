// src/index.rs

//! Persistent chunk index: fingerprint -> where that chunk was last seen.
//!
//! Several records may share one fingerprint. Each record is stored under
//! `fingerprint (8 bytes BE) ++ unique id (8 bytes BE)`, so all records for a
//! fingerprint sit next to each other in the tree and a prefix scan
//! enumerates exactly them.
//!
//! The index is a hint, not a source of truth. A record may be stale at any
//! moment, and readers must verify chunk content before using it.

use crate::error::Result;
use crate::proto::FileId;
use serde::{ Deserialize, Serialize };
use std::path::Path;

const KEY_LEN: usize = 16;

/// Where a chunk was seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub owner: FileId,
    pub offset: u64,
    pub length: u32,
    /// Owner's mtime when the record was made; `None` for records inserted
    /// before the owner's content was final.
    pub mtime: Option<u64>,
}

fn make_key(fingerprint: u64, id: u64) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[..8].copy_from_slice(&fingerprint.to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

fn fingerprint_of(key: &[u8]) -> u64 {
    let mut fp = [0u8; 8];
    fp.copy_from_slice(&key[..8]);
    u64::from_be_bytes(fp)
}

pub struct ChunkIndex {
    db: sled::Db,
}

impl ChunkIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        log::debug!("Opened chunk index at {:?} ({} entries)", path.as_ref(), db.len());
        Ok(ChunkIndex { db })
    }

    /// Opens the index and drops every entry in it.
    pub fn open_and_truncate(path: impl AsRef<Path>) -> Result<Self> {
        let index = Self::open(path)?;
        index.db.clear()?;
        index.db.flush()?;
        Ok(index)
    }

    /// An index that lives only as long as this value.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(ChunkIndex { db })
    }

    /// Adds a record. Existing records with the same fingerprint are kept.
    pub fn insert(&self, fingerprint: u64, record: &LocationRecord) -> Result<()> {
        let id = self.db.generate_id()?;
        let value = bincode::serialize(record)?;
        self.db.insert(make_key(fingerprint, id), value)?;
        Ok(())
    }

    /// Any one record for `fingerprint`.
    pub fn lookup_one(&self, fingerprint: u64) -> Result<Option<LocationRecord>> {
        Ok(self.open_cursor(fingerprint)?.map(|c| c.record))
    }

    /// Cursor over every record for `fingerprint`, or `None` if there is none.
    pub fn open_cursor(&self, fingerprint: u64) -> Result<Option<Cursor>> {
        let iter = self.db.scan_prefix(fingerprint.to_be_bytes());
        Cursor::start(self.db.clone(), iter)
    }

    /// Cursor over the whole index, in fingerprint order.
    pub fn open_cursor_all(&self) -> Result<Option<Cursor>> {
        Cursor::start(self.db.clone(), self.db.iter())
    }

    /// Cursor over the entries at or after `key`, as returned by
    /// [`Cursor::key`].
    pub fn open_cursor_from(&self, key: &[u8]) -> Result<Option<Cursor>> {
        Cursor::start(self.db.clone(), self.db.range(key.to_vec()..))
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flushes pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Position on one index entry.
pub struct Cursor {
    db: sled::Db,
    iter: sled::Iter,
    key: sled::IVec,
    record: LocationRecord,
    deleted: bool,
}

impl Cursor {
    fn start(db: sled::Db, mut iter: sled::Iter) -> Result<Option<Cursor>> {
        Ok(
            next_entry(&db, &mut iter)?.map(|(key, record)| Cursor {
                db,
                iter,
                key,
                record,
                deleted: false,
            })
        )
    }

    pub fn fingerprint(&self) -> u64 {
        fingerprint_of(&self.key)
    }

    /// Raw key of the current entry; usable with [`ChunkIndex::open_cursor_from`].
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The current record, or `None` once it has been deleted.
    pub fn get(&self) -> Option<&LocationRecord> {
        if self.deleted { None } else { Some(&self.record) }
    }

    /// Moves to the next entry. Returns false, leaving the cursor on the
    /// last entry, once there is none.
    pub fn advance(&mut self) -> Result<bool> {
        match next_entry(&self.db, &mut self.iter)? {
            Some((key, record)) => {
                self.key = key;
                self.record = record;
                self.deleted = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes the entry under the cursor, and only that entry.
    pub fn delete_current(&mut self) -> Result<()> {
        if !self.deleted {
            self.db.remove(&self.key)?;
            self.deleted = true;
        }
        Ok(())
    }
}

// Undecodable values are dropped from the index rather than failing the scan.
fn next_entry(db: &sled::Db, iter: &mut sled::Iter) -> Result<Option<(sled::IVec, LocationRecord)>> {
    for item in iter {
        let (key, value) = item?;
        if key.len() != KEY_LEN {
            log::warn!("Dropping index entry with malformed key ({} bytes)", key.len());
            db.remove(&key)?;
            continue;
        }
        match bincode::deserialize::<LocationRecord>(&value) {
            Ok(record) => {
                return Ok(Some((key, record)));
            }
            Err(e) => {
                log::warn!("Dropping undecodable index entry {:016x}: {}", fingerprint_of(&key), e);
                db.remove(&key)?;
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str, offset: u64, length: u32) -> LocationRecord {
        LocationRecord {
            owner: FileId::new(owner).unwrap(),
            offset,
            length,
            mtime: None,
        }
    }

    fn all_for(index: &ChunkIndex, fp: u64) -> Vec<LocationRecord> {
        let mut out = Vec::new();
        if let Some(mut cursor) = index.open_cursor(fp).unwrap() {
            loop {
                assert_eq!(cursor.fingerprint(), fp);
                out.extend(cursor.get().cloned());
                if !cursor.advance().unwrap() {
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn test_insert_then_cursor() {
        let index = ChunkIndex::temporary().unwrap();
        let loc = record("a.txt", 0, 11);
        index.insert(7, &loc).unwrap();

        let cursor = index.open_cursor(7).unwrap().expect("cursor for inserted key");
        assert_eq!(cursor.get(), Some(&loc));
        assert_eq!(index.lookup_one(7).unwrap(), Some(loc));
        assert!(index.open_cursor(8).unwrap().is_none());
        assert_eq!(index.lookup_one(8).unwrap(), None);
    }

    #[test]
    fn test_duplicate_keys_enumerated_once_each() {
        let index = ChunkIndex::temporary().unwrap();
        let a = record("a", 0, 100);
        let b = record("b", 4096, 100);
        index.insert(42, &b).unwrap();
        index.insert(42, &a).unwrap();
        // Neighbouring fingerprints must not leak into the cursor.
        index.insert(41, &record("c", 0, 1)).unwrap();
        index.insert(43, &record("d", 0, 1)).unwrap();

        let found = all_for(&index, 42);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&a));
        assert!(found.contains(&b));
    }

    #[test]
    fn test_delete_current_removes_only_that_entry() {
        let index = ChunkIndex::temporary().unwrap();
        index.insert(5, &record("keep", 0, 10)).unwrap();
        index.insert(5, &record("drop", 0, 10)).unwrap();

        let mut cursor = index.open_cursor(5).unwrap().unwrap();
        while cursor.get().unwrap().owner.as_bytes() != b"drop" {
            assert!(cursor.advance().unwrap());
        }
        cursor.delete_current().unwrap();
        assert_eq!(cursor.get(), None);
        cursor.delete_current().unwrap();
        assert_eq!(cursor.get(), None);

        assert_eq!(all_for(&index, 5), vec![record("keep", 0, 10)]);

        let mut cursor = index.open_cursor(5).unwrap().unwrap();
        cursor.delete_current().unwrap();
        assert!(cursor.get().is_none());
        assert!(!cursor.advance().unwrap());
        assert!(cursor.get().is_none());
        assert!(index.open_cursor(5).unwrap().is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_cursor_all_walks_every_entry() {
        let index = ChunkIndex::temporary().unwrap();
        for fp in [3u64, 1, 2, 2] {
            index.insert(fp, &record("f", fp, 1)).unwrap();
        }
        let mut cursor = index.open_cursor_all().unwrap().unwrap();
        let mut fps = vec![cursor.fingerprint()];
        while cursor.advance().unwrap() {
            fps.push(cursor.fingerprint());
        }
        assert_eq!(fps, vec![1, 2, 2, 3]);
    }

    #[test]
    fn test_cursor_resumes_from_key() {
        let index = ChunkIndex::temporary().unwrap();
        for fp in [1u64, 2, 3, u64::MAX] {
            index.insert(fp, &record("f", fp, 1)).unwrap();
        }
        let mut cursor = index.open_cursor_all().unwrap().unwrap();
        assert!(cursor.advance().unwrap());
        let key = cursor.key().to_vec();
        drop(cursor);

        let mut cursor = index.open_cursor_from(&key).unwrap().unwrap();
        let mut fps = vec![cursor.fingerprint()];
        while cursor.advance().unwrap() {
            fps.push(cursor.fingerprint());
        }
        assert_eq!(fps, vec![2, 3, u64::MAX]);
    }

    #[test]
    fn test_index_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        {
            let index = ChunkIndex::open(&path).unwrap();
            index.insert(99, &record("resume.pdf", 0, 14)).unwrap();
            index.sync().unwrap();
        } // <--- Index is dropped here (Simulates closing the app)

        {
            let index = ChunkIndex::open(&path).unwrap();
            assert_eq!(index.lookup_one(99).unwrap(), Some(record("resume.pdf", 0, 14)));
        }

        let index = ChunkIndex::open_and_truncate(&path).unwrap();
        assert!(index.is_empty());
    }
}
