// src/error.rs

use crate::proto::RpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Chunk index error: {0}")]
    Storage(#[from] sled::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Remote call failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Invalid file handle: {0}")]
    BadHandle(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Session aborted: {0}")]
    Aborted(String),
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
