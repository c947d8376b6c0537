// src/config.rs

use crate::chunker::ChunkParams;
use crate::error::{ Error, Result };
use crate::gc::GcConfig;
use serde::{ Deserialize, Serialize };
use std::path::{ Path, PathBuf };

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the local file store.
    pub data_dir: PathBuf,
    /// Directory of the chunk index database; `<data_dir>/.chunk_index`
    /// when unset.
    pub index_path: Option<PathBuf>,
    pub chunking: ChunkParams,
    pub session: SessionConfig,
    pub gc: GcConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// CONDWRITE/WRITE requests in flight per write session.
    pub max_outstanding: usize,
    /// Extra attempts after a transport failure.
    pub rpc_retries: u32,
    /// Bytes read per step when chunking a stream.
    pub block_size: usize,
    /// Descriptors per GETFP reply.
    pub getfp_max_chunks: usize,
    /// Largest plain READ, in bytes.
    pub read_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_outstanding: 8,
            rpc_retries: 1,
            block_size: 8192,
            getfp_max_chunks: 64,
            read_size: 64 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::for_dir("./lbfs_data")
    }
}

impl Config {
    /// Defaults with the store and its index under `data_dir`.
    pub fn for_dir(data_dir: impl Into<PathBuf>) -> Self {
        Config {
            data_dir: data_dir.into(),
            index_path: None,
            chunking: ChunkParams::default(),
            session: SessionConfig::default(),
            gc: GcConfig::default(),
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path.clone().unwrap_or_else(|| self.data_dir.join(".chunk_index"))
    }

    /// Loads `path` (or `./lbfs.toml` when present), then `LBFS_*`
    /// environment variables, e.g. `LBFS_SESSION__MAX_OUTSTANDING=16`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("lbfs").required(false)),
        };
        let config: Config = builder
            .add_source(config::Environment::with_prefix("LBFS").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.validate().map_err(Error::Config)?;
        if self.session.max_outstanding == 0 {
            return Err(Error::Config("session.max_outstanding must be at least 1".into()));
        }
        if self.session.block_size == 0 || self.session.read_size == 0 {
            return Err(Error::Config("session.block_size and session.read_size must be positive".into()));
        }
        if self.session.getfp_max_chunks == 0 {
            return Err(Error::Config("session.getfp_max_chunks must be at least 1".into()));
        }
        Ok(())
    }
}
