// src/main.rs
use anyhow::{ bail, Context, Result };
use clap::{ Parser, Subcommand };
use lbfs::chunker;
use lbfs::proto::CreateAttrs;
use lbfs::{
    gc,
    ChunkIndex,
    Config,
    DedupReadReconstructor,
    DedupWriteSession,
    FileId,
    LoopbackPeer,
    Node,
    Server,
    Storage,
};
use std::path::{ Path, PathBuf };

#[derive(Parser)]
#[command(name = "lbfs")]
#[command(about = "Deduplicating file transfer between chunk-indexed stores", long_about = None)]
struct Cli {
    /// Configuration file (default: ./lbfs.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local store, overriding `data_dir`
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the chunks of any file
    Chunk {
        file: PathBuf,
    },
    /// Index every file in the local store
    Scan {
        /// Drop the existing index first
        #[arg(long)]
        rebuild: bool,
    },
    /// List the index records for a fingerprint (hex)
    Lookup {
        fingerprint: String,
    },
    /// Delete index records of files that changed or disappeared
    Gc {
        /// Keep sweeping every `gc.interval_secs`
        #[arg(long)]
        watch: bool,
    },
    /// Write a local file into another store
    Push {
        name: String,
        #[arg(long)]
        to: PathBuf,
    },
    /// Read a file from another store into the local one
    Pull {
        name: String,
        #[arg(long)]
        from: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    match args.command {
        Commands::Chunk { file } => {
            let chunks = chunker::chunk_file(&file, &config.chunking, true, config.session.block_size)
                .with_context(|| format!("chunking {:?}", file))?;
            for c in &chunks {
                let hash = c.strong_hash.map(|h| h.to_string()).unwrap_or_default();
                println!("{:>12} {:>8} {:016x} {}", c.offset, c.length, c.fingerprint, hash);
            }
            eprintln!("{} chunks", chunks.len());
        }
        Commands::Scan { rebuild } => {
            let node = if rebuild {
                let storage = Storage::new(&config.data_dir)?;
                let index = ChunkIndex::open_and_truncate(config.index_path())?;
                Node::new(storage, index, config.chunking, config.session.block_size)
            } else {
                Node::open(&config)?
            };
            let report = node.scan()?;
            println!(
                "{} files indexed ({} chunks), {} unchanged, {} unreadable",
                report.files,
                report.chunks,
                report.skipped,
                report.unreadable
            );
        }
        Commands::Lookup { fingerprint } => {
            let fp = u64::from_str_radix(fingerprint.trim_start_matches("0x"), 16)
                .with_context(|| format!("{:?} is not a hex fingerprint", fingerprint))?;
            let node = Node::open(&config)?;
            let Some(mut cursor) = node.index.open_cursor(fp)? else {
                println!("No records for {:016x}", fp);
                return Ok(());
            };
            loop {
                if let Some(r) = cursor.get() {
                    let generation = r.mtime.map(|m| m.to_string()).unwrap_or_else(|| "provisional".into());
                    println!("{} @ {} (+{}) [{}]", r.owner, r.offset, r.length, generation);
                }
                if !cursor.advance()? {
                    break;
                }
            }
        }
        Commands::Gc { watch } => {
            let node = Node::open(&config)?;
            let queued = node.audit()?;
            log::info!("Checked {} owners", queued);
            if watch {
                gc::run_periodic(&node.gc, &node.index, &config.gc).await;
            } else {
                let report = node.gc.sweep(&node.index, None)?;
                node.index.sync()?;
                println!("Scanned {} records, deleted {}", report.scanned, report.deleted);
            }
        }
        Commands::Push { name, to } => {
            let id = FileId::new(name.as_str())?;
            let local = Node::open(&config)?;
            let server = Server::new(open_other(&config, &to)?, config.session);
            let peer = LoopbackPeer::new(&server);

            let mode = local.storage.attrs(&id).with_context(|| format!("{} is not in the local store", name))?.mode;
            let mut session = DedupWriteSession::new(&peer, &local, &config.session, id.clone(), id);
            let outcome = session.run(CreateAttrs { mode }).await?;
            println!(
                "Pushed {} bytes: {} of {} chunks deduplicated, {} bytes sent",
                outcome.attrs.size,
                outcome.stats.condwrite_hits,
                outcome.stats.chunks,
                outcome.stats.bytes_sent
            );
        }
        Commands::Pull { name, from } => {
            let id = FileId::new(name.as_str())?;
            let local = Node::open(&config)?;
            local.scan()?;
            let server = Server::new(open_other(&config, &from)?, config.session);
            let peer = LoopbackPeer::new(&server);

            let mut reader = DedupReadReconstructor::new(&peer, &local, &config.session, id.clone(), id);
            let outcome = reader.materialize().await?;
            println!(
                "Pulled {} bytes: {} chunks reused, {} fetched ({} bytes)",
                outcome.attrs.size,
                outcome.stats.chunks_reused,
                outcome.stats.chunks_fetched,
                outcome.stats.bytes_fetched
            );
        }
    }
    Ok(())
}

/// Opens the other end of a push or pull, with its index brought up to date.
fn open_other(config: &Config, dir: &Path) -> Result<Node> {
    if dir == config.data_dir {
        bail!("{:?} is the local store", dir);
    }
    let mut other = config.clone();
    other.data_dir = dir.to_path_buf();
    other.index_path = None;
    let node = Node::open(&other).with_context(|| format!("opening store {:?}", dir))?;
    node.scan()?;
    Ok(node)
}
