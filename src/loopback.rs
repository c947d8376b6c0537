// src/loopback.rs

//! In-process transport: every call is encoded, decoded, dispatched on a
//! [`Server`], and its reply encoded and decoded again, so both ends see
//! exactly what a network peer would. Failures can be injected per message
//! kind to exercise retries and fallbacks.

use crate::proto::{
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
use crate::server::Server;
use std::collections::HashMap;
use std::sync::{ Mutex, MutexGuard };

#[derive(Default)]
struct Faults {
    failures: HashMap<&'static str, u32>,
    calls: HashMap<&'static str, usize>,
}

pub struct LoopbackPeer<'a> {
    server: &'a Server,
    faults: Mutex<Faults>,
}

impl<'a> LoopbackPeer<'a> {
    pub fn new(server: &'a Server) -> Self {
        LoopbackPeer {
            server,
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn server(&self) -> &Server {
        self.server
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `count` calls of `kind` (e.g. `"CONDWRITE"`) fail
    /// with a transport error before reaching the server.
    pub fn inject_failures(&self, kind: &'static str, count: u32) {
        self.faults().failures.insert(kind, count);
    }

    /// Calls of `kind` issued so far, failed ones included.
    pub fn calls(&self, kind: &str) -> usize {
        self.faults().calls.get(kind).copied().unwrap_or(0)
    }

    async fn call(&self, request: Request) -> RpcResult<Response> {
        let kind = request.kind();
        let fail = {
            let mut faults = self.faults();
            *faults.calls.entry(kind).or_insert(0) += 1;
            match faults.failures.get_mut(kind) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            log::debug!("Injected transport failure for {}", kind);
            return Err(RpcError::Transport(format!("injected {} failure", kind)));
        }

        let wire = request.encode().map_err(transport)?;
        let request = Request::decode(&wire).map_err(transport)?;
        // Let other in-flight calls run, as a real round trip would.
        tokio::task::yield_now().await;
        let reply = self.server.dispatch(request);
        let wire = reply.encode().map_err(transport)?;
        match Response::decode(&wire).map_err(transport)? {
            Response::Error(e) => Err(e),
            reply => Ok(reply),
        }
    }
}

fn transport(e: crate::Error) -> RpcError {
    RpcError::Transport(e.to_string())
}

fn unexpected(reply: Response) -> RpcError {
    RpcError::Transport(format!("unexpected reply {:?}", reply))
}

impl Peer for LoopbackPeer<'_> {
    async fn mktmpfile(&self, target: &FileId, attrs: &CreateAttrs) -> RpcResult<FileId> {
        match self.call(Request::MkTmpFile { target: target.clone(), attrs: *attrs }).await? {
            Response::TmpFile(temp) => Ok(temp),
            other => Err(unexpected(other)),
        }
    }

    async fn condwrite(&self, args: &CondWriteArgs) -> RpcResult<u32> {
        match self.call(Request::CondWrite(args.clone())).await? {
            Response::Written(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    async fn write(&self, file: &FileId, offset: u64, data: &[u8]) -> RpcResult<u32> {
        let request = Request::Write { file: file.clone(), offset, data: data.to_vec() };
        match self.call(request).await? {
            Response::Written(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    async fn committmp(&self, temp: &FileId, target: &FileId) -> RpcResult<FileAttr> {
        match self.call(Request::CommitTmp { temp: temp.clone(), target: target.clone() }).await? {
            Response::Committed(attrs) => Ok(attrs),
            other => Err(unexpected(other)),
        }
    }

    async fn aborttmp(&self, temp: &FileId) -> RpcResult<()> {
        match self.call(Request::AbortTmp { temp: temp.clone() }).await? {
            Response::Aborted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn getfp(&self, file: &FileId, offset: u64, max_len: u64) -> RpcResult<GetFpReply> {
        match self.call(Request::GetFp { file: file.clone(), offset, max_len }).await? {
            Response::Fingerprints(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    async fn read(&self, file: &FileId, offset: u64, count: u32) -> RpcResult<ReadReply> {
        match self.call(Request::Read { file: file.clone(), offset, count }).await? {
            Response::Data(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkParams;
    use crate::config::SessionConfig;
    use crate::index::ChunkIndex;
    use crate::node::Node;
    use crate::storage::Storage;

    fn server(dir: &std::path::Path) -> Server {
        let storage = Storage::new(dir).unwrap();
        let node = Node::new(storage, ChunkIndex::temporary().unwrap(), ChunkParams::default(), 4096);
        Server::new(node, SessionConfig::default())
    }

    #[tokio::test]
    async fn test_calls_reach_server_through_codec() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        server.node().storage.put(&FileId::new("f").unwrap(), b"loopback").unwrap();
        let peer = LoopbackPeer::new(&server);

        let reply = peer.read(&FileId::new("f").unwrap(), 4, 100).await.unwrap();
        assert_eq!(reply, ReadReply { data: b"back".to_vec(), eof: true });
        assert_eq!(
            peer.read(&FileId::new("nope").unwrap(), 0, 1).await,
            Err(RpcError::Errno(libc::ENOENT))
        );
        assert_eq!(peer.calls("READ"), 2);
        assert_eq!(server.stats().reads, 1);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let peer = LoopbackPeer::new(&server);
        peer.inject_failures("MKTMPFILE", 1);

        let target = FileId::new("t").unwrap();
        let first = peer.mktmpfile(&target, &CreateAttrs::default()).await;
        assert!(matches!(first, Err(RpcError::Transport(_))));
        assert_eq!(server.open_temps(), 0);

        peer.mktmpfile(&target, &CreateAttrs::default()).await.unwrap();
        assert_eq!(server.open_temps(), 1);
        assert_eq!(peer.calls("MKTMPFILE"), 2);
    }
}
