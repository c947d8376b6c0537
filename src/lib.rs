// src/lib.rs

//! Low-bandwidth file transfer: content-defined chunking, a
//! fingerprint-keyed chunk index, and a write/read protocol that only moves
//! the bytes the other side cannot find in files it already holds.

pub mod chunker;
pub mod config;
pub mod error;
pub mod gc;
pub mod index;
pub mod loopback;
pub mod node;
pub mod proto;
pub mod rabin;
pub mod reconstruct;
pub mod server;
pub mod storage;
pub mod write_session;

pub use chunker::{ Chunk, ChunkParams, Chunker, StrongHash };
pub use config::{ Config, SessionConfig };
pub use error::{ Error, Result };
pub use gc::{ GcConfig, GcReport, GcTracker };
pub use index::{ ChunkIndex, Cursor, LocationRecord };
pub use loopback::LoopbackPeer;
pub use node::Node;
pub use proto::{ FileId, Peer, RpcError };
pub use rabin::RollingFingerprint;
pub use reconstruct::{ DedupReadReconstructor, ReadOutcome, ReadStats };
pub use server::{ Server, ServerStats };
pub use storage::Storage;
pub use write_session::{ DedupWriteSession, SessionState, WriteOutcome, WriteStats };
