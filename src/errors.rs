use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("json encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("block rejected: {0}")]
    Block(String),
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("asset error: {0}")]
    Asset(String),
    #[error(
        "upload of asset {asset_hash} timed out with {acknowledged}/{total} chunks acknowledged"
    )]
    UploadTimeout {
        asset_hash: String,
        acknowledged: usize,
        total: usize,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;
