// src/chunker.rs

//! Content-defined chunking.
//!
//! A boundary is declared at a byte when the windowed Rabin hash, taken
//! modulo the target average size `K`, equals the breakmark. Both the
//! windowed hash and the per-chunk fingerprint are reset at every boundary,
//! so a cut depends only on the bytes since the previous cut: the same
//! content splits identically however it is handed to [`Chunker::feed`].

use crate::rabin::{ self, RollingFingerprint, DEFAULT_POLYNOMIAL };
use serde::{ Deserialize, Serialize };
use sha2::{ Digest, Sha256 };
use std::fmt;
use std::fs::File;
use std::io::{ self, Read };
use std::path::Path;

pub const DEFAULT_AVERAGE_SIZE: u32 = 8192;
pub const DEFAULT_BREAKMARK: u64 = 0x78;
pub const MIN_AVERAGE_SIZE: u32 = 64;

/// Length of a [`StrongHash`] in bytes.
pub const STRONG_HASH_LEN: usize = 20;

// Chunk lengths travel as u32; a boundary is forced only at that limit.
const MAX_CHUNK_LEN: u64 = u32::MAX as u64;

/// Cryptographic digest of a chunk's exact bytes (truncated SHA-256).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongHash(pub [u8; STRONG_HASH_LEN]);

impl StrongHash {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    fn from_hasher(hasher: Sha256) -> Self {
        let digest = hasher.finalize();
        let mut out = [0u8; STRONG_HASH_LEN];
        out.copy_from_slice(&digest[..STRONG_HASH_LEN]);
        StrongHash(out)
    }
}

impl fmt::Display for StrongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for StrongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrongHash({})", hex::encode(self.0))
    }
}

/// Chunking constants. Both ends of a transfer must agree on these for
/// dedup to hit; a mismatch only costs bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkParams {
    /// Target average chunk size `K`, a power of two.
    pub average_size: u32,
    pub breakmark: u64,
    pub polynomial: u64,
}

impl Default for ChunkParams {
    fn default() -> Self {
        ChunkParams {
            average_size: DEFAULT_AVERAGE_SIZE,
            breakmark: DEFAULT_BREAKMARK,
            polynomial: DEFAULT_POLYNOMIAL,
        }
    }
}

impl ChunkParams {
    pub fn with_average_size(average_size: u32) -> Self {
        ChunkParams { average_size, ..Default::default() }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.average_size.is_power_of_two() || self.average_size < MIN_AVERAGE_SIZE {
            return Err(format!(
                "average chunk size {} must be a power of two >= {}",
                self.average_size, MIN_AVERAGE_SIZE
            ));
        }
        if self.breakmark >= u64::from(self.average_size) {
            return Err(format!(
                "breakmark {:#x} must be below the average chunk size {}",
                self.breakmark, self.average_size
            ));
        }
        if !rabin::is_valid_polynomial(self.polynomial) {
            return Err(format!(
                "polynomial {:#x} must have degree {}..={}",
                self.polynomial,
                rabin::MIN_DEGREE,
                rabin::MAX_DEGREE
            ));
        }
        Ok(())
    }
}

/// One content-defined piece of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub offset: u64,
    pub length: u32,
    /// Rabin fingerprint of the whole chunk; the chunk index key.
    pub fingerprint: u64,
    pub strong_hash: Option<StrongHash>,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }
}

pub struct Chunker {
    rolling: RollingFingerprint,
    mask: u64,
    breakmark: u64,

    // Fingerprint of the bytes since the last boundary.
    acc: u64,
    start: u64,
    position: u64,
    hasher: Option<Sha256>,

    chunks: Vec<Chunk>,
    finished: bool,
}

impl Chunker {
    /// Chunker with target average size `average_size` and the default
    /// breakmark and polynomial.
    pub fn new(average_size: u32, strong: bool) -> Self {
        Self::with_params(&ChunkParams::with_average_size(average_size), strong)
    }

    /// # Panics
    ///
    /// Panics if `params` does not pass [`ChunkParams::validate`].
    pub fn with_params(params: &ChunkParams, strong: bool) -> Self {
        if let Err(e) = params.validate() {
            panic!("invalid chunking parameters: {}", e);
        }
        Chunker {
            rolling: RollingFingerprint::new(params.polynomial),
            mask: u64::from(params.average_size) - 1,
            breakmark: params.breakmark,
            acc: 0,
            start: 0,
            position: 0,
            hasher: strong.then(Sha256::new),
            chunks: Vec::new(),
            finished: false,
        }
    }

    /// Processes the next piece of the stream.
    pub fn feed(&mut self, data: &[u8]) {
        debug_assert!(!self.finished, "feed() after finish()");
        if self.finished {
            return;
        }

        // Start of the not-yet-hashed part of `data`.
        let mut pending = 0;
        for (i, &byte) in data.iter().enumerate() {
            let windowed = self.rolling.roll(byte);
            self.acc = self.rolling.append(self.acc, byte);
            self.position += 1;

            let cut = self.rolling.is_full() && (windowed & self.mask) == self.breakmark;
            if cut || self.position - self.start >= MAX_CHUNK_LEN {
                if let Some(hasher) = self.hasher.as_mut() {
                    hasher.update(&data[pending..=i]);
                }
                pending = i + 1;
                self.emit();
            }
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&data[pending..]);
        }
    }

    /// Closes the residual bytes into a final chunk. An empty stream yields a
    /// single zero-length chunk.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        if self.position > self.start || self.chunks.is_empty() {
            self.emit();
        }
        self.finished = true;
    }

    /// Completed chunks so far, in stream order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.position
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn emit(&mut self) {
        let strong_hash = self
            .hasher
            .as_mut()
            .map(|h| StrongHash::from_hasher(std::mem::take(h)));
        let chunk = Chunk {
            offset: self.start,
            length: (self.position - self.start) as u32,
            fingerprint: self.acc,
            strong_hash,
        };
        log::trace!(
            "chunk at {} len {} fp {:016x}",
            chunk.offset,
            chunk.length,
            chunk.fingerprint
        );
        self.chunks.push(chunk);

        self.start = self.position;
        self.acc = 0;
        self.rolling.reset();
    }
}

/// Chunks an in-memory buffer.
pub fn chunk_bytes(data: &[u8], params: &ChunkParams, strong: bool) -> Vec<Chunk> {
    let mut chunker = Chunker::with_params(params, strong);
    chunker.feed(data);
    chunker.finish();
    chunker.into_chunks()
}

/// Chunks everything `reader` yields, reading `block_size` bytes at a time.
pub fn chunk_reader<R: Read>(
    mut reader: R,
    params: &ChunkParams,
    strong: bool,
    block_size: usize,
) -> io::Result<Vec<Chunk>> {
    let mut chunker = Chunker::with_params(params, strong);
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        chunker.feed(&buf[..n]);
    }
    chunker.finish();
    Ok(chunker.into_chunks())
}

pub fn chunk_file(
    path: &Path,
    params: &ChunkParams,
    strong: bool,
    block_size: usize,
) -> io::Result<Vec<Chunk>> {
    chunk_reader(File::open(path)?, params, strong, block_size)
}
