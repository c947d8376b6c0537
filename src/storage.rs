// src/storage.rs
use crate::error::{ Error, Result };
use crate::proto::{ FileAttr, FileId };
use std::fs::{ self, File, OpenOptions };
use std::io::{ self, ErrorKind };
use std::os::unix::fs::{ FileExt, PermissionsExt };
use std::path::{ Component, Path, PathBuf };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::time::UNIX_EPOCH;

/// Prefix of temp files created by MKTMPFILE; they live next to the files
/// they replace so the final rename stays on one file system.
pub const TEMP_PREFIX: &str = ".lbfs-tmp.";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One endpoint's files, addressed by identity. An identity is the file's
/// path relative to `root_dir`.
pub struct Storage {
    root_dir: PathBuf,
}

impl Storage {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = path.into();
        fs::create_dir_all(&root_dir)?;
        let storage = Storage { root_dir };
        let removed = storage.remove_stale_temps()?;
        if removed > 0 {
            log::info!("Removed {} leftover temp files from {:?}", removed, storage.root_dir);
        }
        Ok(storage)
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Resolves an identity to a path under the root, rejecting anything
    /// that would escape it.
    pub fn path_of(&self, id: &FileId) -> Result<PathBuf> {
        let rel = std::str::from_utf8(id.as_bytes())
            .map_err(|_| Error::BadHandle(format!("{:?} is not UTF-8", id)))?;
        let rel = Path::new(rel);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(Error::BadHandle(format!("{:?} is not a plain relative path", id)));
        }
        Ok(self.root_dir.join(rel))
    }

    pub fn exists(&self, id: &FileId) -> bool {
        self.path_of(id).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn open(&self, id: &FileId) -> Result<File> {
        Ok(File::open(self.path_of(id)?)?)
    }

    /// Reads up to `len` bytes at `offset`; shorter only at end of file.
    pub fn read_range(&self, id: &FileId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.open(id)?;
        Ok(read_range_from(&file, offset, len)?)
    }

    /// Reads exactly `len` bytes at `offset`.
    pub fn read_exact_range(&self, id: &FileId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.open(id)?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Writes `data` at `offset` into an existing file.
    pub fn write_at(&self, id: &FileId, offset: u64, data: &[u8]) -> Result<()> {
        let file = OpenOptions::new().write(true).open(self.path_of(id)?)?;
        file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Creates or replaces a whole file.
    pub fn put(&self, id: &FileId, data: &[u8]) -> Result<()> {
        let path = self.path_of(id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }

    pub fn get(&self, id: &FileId) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_of(id)?)?)
    }

    pub fn set_len(&self, id: &FileId, len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(self.path_of(id)?)?;
        file.set_len(len)?;
        Ok(())
    }

    pub fn attrs(&self, id: &FileId) -> Result<FileAttr> {
        let meta = fs::metadata(self.path_of(id)?)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(FileAttr {
            size: meta.len(),
            mtime,
            mode: meta.permissions().mode() & 0o7777,
        })
    }

    /// Creates an empty temp file beside `target`. A name collision is
    /// retried once with a fresh name.
    pub fn create_temp(&self, target: &FileId, mode: u32) -> Result<FileId> {
        let target_path = self.path_of(target)?;
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match self.try_create_temp(target, mode) {
            Err(Error::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                log::warn!("Temp name for {} already taken, picking another", target);
                self.try_create_temp(target, mode)
            }
            other => other,
        }
    }

    fn try_create_temp(&self, target: &FileId, mode: u32) -> Result<FileId> {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}{}.{}", TEMP_PREFIX, std::process::id(), n);
        let rel = match Path::new(&target.to_string()).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(name),
            _ => PathBuf::from(name),
        };
        let temp = FileId::new(rel.to_string_lossy().into_owned())?;
        let file = OpenOptions::new().write(true).create_new(true).open(self.path_of(&temp)?)?;
        file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(temp)
    }

    /// Atomically replaces `target` with `temp`.
    pub fn rename(&self, temp: &FileId, target: &FileId) -> Result<FileAttr> {
        fs::rename(self.path_of(temp)?, self.path_of(target)?)?;
        self.attrs(target)
    }

    pub fn remove(&self, id: &FileId) -> Result<()> {
        fs::remove_file(self.path_of(id)?)?;
        Ok(())
    }

    /// Every regular, non-temp file under the root, as identities.
    pub fn list_files(&self) -> Result<Vec<FileId>> {
        let mut files = Vec::new();
        self.walk(&self.root_dir, &mut |path| {
            if is_temp(path) || is_hidden(path) {
                return Ok(());
            }
            if let Ok(rel) = path.strip_prefix(&self.root_dir) {
                match FileId::new(rel.to_string_lossy().into_owned()) {
                    Ok(id) => files.push(id),
                    Err(e) => log::warn!("Skipping {:?}: {}", path, e),
                }
            }
            Ok(())
        })?;
        files.sort();
        Ok(files)
    }

    fn remove_stale_temps(&self) -> Result<usize> {
        let mut removed = 0;
        self.walk(&self.root_dir, &mut |path| {
            if is_temp(path) {
                fs::remove_file(path)?;
                removed += 1;
            }
            Ok(())
        })?;
        Ok(removed)
    }

    // Hidden directories (the chunk index among them) are not descended into.
    fn walk(&self, dir: &Path, visit: &mut dyn FnMut(&Path) -> io::Result<()>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let kind = entry.file_type()?;
            if kind.is_dir() {
                if !is_hidden(&path) {
                    self.walk(&path, visit)?;
                }
            } else if kind.is_file() {
                visit(&path)?;
            }
        }
        Ok(())
    }
}

/// Reads up to `len` bytes at `offset`, stopping early only at end of file.
pub fn read_range_from(file: &File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match file.read_at(&mut buf[filled..], offset + (filled as u64)) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(e);
            }
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn file_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
}

fn is_temp(path: &Path) -> bool {
    file_name(path).starts_with(TEMP_PREFIX)
}

fn is_hidden(path: &Path) -> bool {
    file_name(path).starts_with('.')
}
