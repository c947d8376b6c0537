// tests/backend_stress.rs

use lbfs::proto::CreateAttrs;
use lbfs::{
    ChunkIndex,
    ChunkParams,
    Config,
    DedupReadReconstructor,
    DedupWriteSession,
    FileId,
    LoopbackPeer,
    Node,
    Server,
    SessionConfig,
    SessionState,
    Storage,
};
use std::path::Path;
use tempfile::TempDir;

fn id(s: &str) -> FileId {
    FileId::new(s).unwrap()
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

fn open_node(dir: &Path) -> Node {
    let storage = Storage::new(dir).unwrap();
    Node::new(storage, ChunkIndex::temporary().unwrap(), ChunkParams::default(), 8192)
}

struct Setup {
    _dir: TempDir,
    client: Node,
    server: Server,
    session: SessionConfig,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let client = open_node(&dir.path().join("client"));
    let session = SessionConfig::default();
    let server = Server::new(open_node(&dir.path().join("server")), session);
    Setup { _dir: dir, client, server, session }
}

async fn push(s: &Setup, name: &str) -> lbfs::Result<lbfs::WriteOutcome> {
    let peer = LoopbackPeer::new(&s.server);
    let mut session = DedupWriteSession::new(&peer, &s.client, &s.session, id(name), id(name));
    session.run(CreateAttrs::default()).await
}

async fn pull_into(s: &Setup, into: &Node, name: &str) -> lbfs::Result<lbfs::ReadOutcome> {
    let peer = LoopbackPeer::new(&s.server);
    let mut reader = DedupReadReconstructor::new(&peer, into, &s.session, id(name), id(name));
    reader.materialize().await
}

#[tokio::test]
async fn test_1_empty_file() {
    let s = setup();
    s.client.storage.put(&id("empty.txt"), &[]).unwrap();
    let outcome = push(&s, "empty.txt").await.expect("Write failed");
    assert_eq!(outcome.attrs.size, 0);
    assert_eq!(outcome.stats.chunks, 1);
    assert_eq!(outcome.stats.bytes_sent, 0);

    // Read it back into a third store
    let dir = tempfile::tempdir().unwrap();
    let reader = open_node(dir.path());
    pull_into(&s, &reader, "empty.txt").await.expect("Read failed");
    assert_eq!(reader.storage.get(&id("empty.txt")).unwrap().len(), 0);
}

#[tokio::test]
async fn test_2_tiny_file() {
    let s = setup();
    s.client.storage.put(&id("tiny.txt"), b"Tiny").unwrap();
    push(&s, "tiny.txt").await.expect("Write failed");
    assert_eq!(s.server.node().storage.get(&id("tiny.txt")).unwrap(), b"Tiny");

    let dir = tempfile::tempdir().unwrap();
    let reader = open_node(dir.path());
    pull_into(&s, &reader, "tiny.txt").await.expect("Read failed");
    assert_eq!(reader.storage.get(&id("tiny.txt")).unwrap(), b"Tiny");
}

#[tokio::test]
async fn test_3_persistence_check() {
    let dir = tempfile::tempdir().unwrap();
    let server_dir = dir.path().join("server");
    let client = open_node(&dir.path().join("client"));
    client.storage.put(&id("resume.pdf"), b"Important Data").unwrap();
    let session = SessionConfig::default();

    // 1. Write through a server backed by an on-disk index
    {
        let server = Server::new(Node::open(&Config::for_dir(&server_dir)).unwrap(), session);
        let peer = LoopbackPeer::new(&server);
        let mut write = DedupWriteSession::new(&peer, &client, &session, id("resume.pdf"), id("resume.pdf"));
        write.run(CreateAttrs::default()).await.unwrap();
    } // server dropped here (index closes)

    // 2. Re-open: the committed file is still indexed
    let node = Node::open(&Config::for_dir(&server_dir)).unwrap();
    assert_eq!(node.storage.get(&id("resume.pdf")).unwrap(), b"Important Data");
    let chunk = node.chunk_file(&id("resume.pdf"), true).unwrap()[0];
    let lookup = node.find_chunk(chunk.fingerprint, &chunk.strong_hash.unwrap(), chunk.length).unwrap();
    assert!(lookup.found.is_some(), "index lost after restart");
}

#[tokio::test]
async fn test_4_large_file_stress() {
    let s = setup();
    // 1MB of pseudo-random data
    let mut data = lcg_data(11, 1024 * 1024);
    s.client.storage.put(&id("large_video.mp4"), &data).unwrap();

    let start = std::time::Instant::now();
    let first = push(&s, "large_video.mp4").await.expect("Write failed");
    println!("Processed 1MB in {:?} ({} chunks)", start.elapsed(), first.stats.chunks);
    assert!(first.stats.chunks > 20);
    assert_eq!(first.stats.bytes_sent + first.stats.bytes_deduped, data.len() as u64);
    assert_eq!(s.server.node().storage.get(&id("large_video.mp4")).unwrap(), data, "1MB file corrupted on write");

    // A small in-place edit only resends the chunks around it.
    for b in &mut data[500_000..500_100] {
        *b = !*b;
    }
    s.client.storage.put(&id("large_video.mp4"), &data).unwrap();
    let second = push(&s, "large_video.mp4").await.unwrap();
    assert!(second.stats.chunks - second.stats.condwrite_hits <= 3, "{:?}", second.stats);
    assert_eq!(s.server.node().storage.get(&id("large_video.mp4")).unwrap(), data);

    // Reading it back into an empty store fetches everything.
    let dir = tempfile::tempdir().unwrap();
    let reader = open_node(dir.path());
    let read = pull_into(&s, &reader, "large_video.mp4").await.expect("Read failed");
    assert_eq!(read.stats.bytes_fetched, data.len() as u64);
    assert_eq!(reader.storage.get(&id("large_video.mp4")).unwrap(), data, "1MB file corrupted on read");
}

#[tokio::test]
async fn test_5_missing_file() {
    let s = setup();
    let peer = LoopbackPeer::new(&s.server);
    let mut session = DedupWriteSession::new(&peer, &s.client, &s.session, id("ghost.txt"), id("ghost.txt"));
    assert!(session.run(CreateAttrs::default()).await.is_err());
    assert_eq!(session.state(), SessionState::Aborted);
    assert_eq!(s.server.open_temps(), 0);
    assert!(!s.server.node().storage.exists(&id("ghost.txt")));

    let dir = tempfile::tempdir().unwrap();
    let reader = open_node(dir.path());
    assert!(pull_into(&s, &reader, "ghost.txt").await.is_err());
    assert!(!reader.storage.exists(&id("ghost.txt")));
}
