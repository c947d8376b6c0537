// src/proto.rs

//! Protocol vocabulary shared by both ends of a transfer: file identities,
//! attributes, the request/reply messages, and the [`Peer`] trait every
//! transport implements.

use crate::chunker::{ Chunk, StrongHash };
use crate::error::{ Error, Result };
use serde::{ Deserialize, Serialize };
use std::fmt;
use std::future::Future;
use std::io;
use thiserror::Error as ThisError;

/// Largest opaque file identity accepted, in bytes.
pub const MAX_FILE_ID_LEN: usize = 64;

/// Opaque identity of a file at one endpoint (a remote file handle).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(Vec<u8>);

impl FileId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > MAX_FILE_ID_LEN {
            return Err(Error::BadHandle(format!(
                "identity must be 1..={} bytes, got {}",
                MAX_FILE_ID_LEN,
                bytes.len()
            )));
        }
        Ok(FileId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({:?})", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    pub size: u64,
    /// Modification time, nanoseconds since the Unix epoch.
    pub mtime: u64,
    pub mode: u32,
}

/// Attributes requested for the file a temp file will become.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAttrs {
    pub mode: u32,
}

impl Default for CreateAttrs {
    fn default() -> Self {
        CreateAttrs { mode: 0o644 }
    }
}

/// "If you hold a chunk with this fingerprint and strong hash, copy it into
/// `file` at `offset`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondWriteArgs {
    pub file: FileId,
    pub offset: u64,
    pub length: u32,
    pub fingerprint: u64,
    pub strong_hash: StrongHash,
}

/// One chunk of a remote file, as described by GETFP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub offset: u64,
    pub length: u32,
    pub fingerprint: u64,
    pub strong_hash: StrongHash,
}

impl ChunkDescriptor {
    /// Descriptor for a chunk produced in strong-hash mode.
    pub fn from_chunk(chunk: &Chunk) -> Option<Self> {
        Some(ChunkDescriptor {
            offset: chunk.offset,
            length: chunk.length,
            fingerprint: chunk.fingerprint,
            strong_hash: chunk.strong_hash?,
        })
    }

    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFpReply {
    pub descriptors: Vec<ChunkDescriptor>,
    pub eof: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReply {
    pub data: Vec<u8>,
    pub eof: bool,
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("fingerprint not found")]
    FingerprintNotFound,

    #[error("remote file system error (errno {0})")]
    Errno(i32),
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

impl RpcError {
    pub fn errno(&self) -> Option<i32> {
        match self {
            RpcError::Errno(e) => Some(*e),
            _ => None,
        }
    }
}

/// Maps a local I/O failure onto the errno sent back to a peer.
pub fn errno_of(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        _ => libc::EIO,
    })
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        RpcError::Errno(errno_of(&e))
    }
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e.into(),
            Error::Rpc(e) => e,
            Error::BadHandle(_) => RpcError::Errno(libc::ESTALE),
            Error::Config(_) => RpcError::Errno(libc::EINVAL),
            Error::Storage(_) | Error::Encoding(_) | Error::Aborted(_) => RpcError::Errno(libc::EIO),
        }
    }
}

/// The remote end of a transfer.
///
/// Every method is a suspension point; nothing else in a session awaits.
#[allow(async_fn_in_trait)]
pub trait Peer {
    async fn mktmpfile(&self, target: &FileId, attrs: &CreateAttrs) -> RpcResult<FileId>;

    /// Returns the number of bytes copied, or `FingerprintNotFound`.
    async fn condwrite(&self, args: &CondWriteArgs) -> RpcResult<u32>;

    async fn write(&self, file: &FileId, offset: u64, data: &[u8]) -> RpcResult<u32>;

    async fn committmp(&self, temp: &FileId, target: &FileId) -> RpcResult<FileAttr>;

    async fn aborttmp(&self, temp: &FileId) -> RpcResult<()>;

    async fn getfp(&self, file: &FileId, offset: u64, max_len: u64) -> RpcResult<GetFpReply>;

    async fn read(&self, file: &FileId, offset: u64, count: u32) -> RpcResult<ReadReply>;
}

/// Retries `call` on transport failures only, at most `retries` times.
pub async fn with_retry<T, F, Fut>(what: &str, retries: u32, mut call: F) -> RpcResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RpcResult<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(RpcError::Transport(msg)) if attempt < retries => {
                attempt += 1;
                log::warn!("{} failed ({}), retry {}/{}", what, msg, attempt, retries);
            }
            other => return other,
        }
    }
}

// =======================================================================
// WIRE MESSAGES
// =======================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    MkTmpFile { target: FileId, attrs: CreateAttrs },
    CondWrite(CondWriteArgs),
    Write { file: FileId, offset: u64, data: Vec<u8> },
    CommitTmp { temp: FileId, target: FileId },
    AbortTmp { temp: FileId },
    GetFp { file: FileId, offset: u64, max_len: u64 },
    Read { file: FileId, offset: u64, count: u32 },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::MkTmpFile { .. } => "MKTMPFILE",
            Request::CondWrite(_) => "CONDWRITE",
            Request::Write { .. } => "WRITE",
            Request::CommitTmp { .. } => "COMMITTMP",
            Request::AbortTmp { .. } => "ABORTTMP",
            Request::GetFp { .. } => "GETFP",
            Request::Read { .. } => "READ",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    TmpFile(FileId),
    Written(u32),
    Committed(FileAttr),
    Aborted,
    Fingerprints(GetFpReply),
    Data(ReadReply),
    Error(RpcError),
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl<T: Into<Response>> From<RpcResult<T>> for Response {
    fn from(r: RpcResult<T>) -> Self {
        match r {
            Ok(v) => v.into(),
            Err(e) => Response::Error(e),
        }
    }
}

impl From<FileId> for Response {
    fn from(v: FileId) -> Self {
        Response::TmpFile(v)
    }
}

impl From<u32> for Response {
    fn from(v: u32) -> Self {
        Response::Written(v)
    }
}

impl From<FileAttr> for Response {
    fn from(v: FileAttr) -> Self {
        Response::Committed(v)
    }
}

impl From<()> for Response {
    fn from(_: ()) -> Self {
        Response::Aborted
    }
}

impl From<GetFpReply> for Response {
    fn from(v: GetFpReply) -> Self {
        Response::Fingerprints(v)
    }
}

impl From<ReadReply> for Response {
    fn from(v: ReadReply) -> Self {
        Response::Data(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_file_id_limits() {
        assert!(FileId::new("a").is_ok());
        assert!(FileId::new(Vec::new()).is_err());
        assert!(FileId::new(vec![b'x'; MAX_FILE_ID_LEN]).is_ok());
        assert!(FileId::new(vec![b'x'; MAX_FILE_ID_LEN + 1]).is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let req = Request::CondWrite(CondWriteArgs {
            file: FileId::new("tmp").unwrap(),
            offset: 8192,
            length: 11,
            fingerprint: 0xdead_beef,
            strong_hash: StrongHash::of(b"hello world"),
        });
        let bytes = req.encode().unwrap();
        assert_eq!(Request::decode(&bytes).unwrap(), req);
        assert_eq!(req.kind(), "CONDWRITE");

        let reply: Response = RpcResult::<u32>::Err(RpcError::FingerprintNotFound).into();
        let bytes = reply.encode().unwrap();
        assert_eq!(Response::decode(&bytes).unwrap(), Response::Error(RpcError::FingerprintNotFound));
    }

    #[test]
    fn test_errno_mapping() {
        let e = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(RpcError::from(e), RpcError::Errno(libc::ENOENT));
        let e = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(RpcError::from(e).errno(), Some(libc::ENOSPC));
    }

    #[tokio::test]
    async fn test_retry_only_on_transport_errors() {
        let calls = Cell::new(0);
        let r: RpcResult<u32> = with_retry("WRITE", 1, || {
            calls.set(calls.get() + 1);
            async { Err(RpcError::Transport("reset".into())) }
        })
        .await;
        assert!(matches!(r, Err(RpcError::Transport(_))));
        assert_eq!(calls.get(), 2);

        calls.set(0);
        let r: RpcResult<u32> = with_retry("CONDWRITE", 3, || {
            calls.set(calls.get() + 1);
            async { Err(RpcError::FingerprintNotFound) }
        })
        .await;
        assert_eq!(r, Err(RpcError::FingerprintNotFound));
        assert_eq!(calls.get(), 1);
    }
}
