use crate::operation::OperationId;
use std::io;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid config at {path}: {reason}")]
    Config { path: PathBuf, reason: String },
    #[error("no pending operation with id {0}")]
    UnknownOperation(OperationId),
    #[error("journal {path} is corrupt at line {line}")]
    CorruptJournal { path: PathBuf, line: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
