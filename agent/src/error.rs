use std::{net::SocketAddr, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no such transfer session or request")]
    NotFound,

    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),

    #[error("save directory {0} does not exist")]
    NoSaveDir(PathBuf),

    #[error("session is not in a startable state")]
    InvalidState,

    #[error("timed out dialing {0}")]
    DialTimeout(SocketAddr),

    #[error("internal I/O error")]
    Io(#[from] std::io::Error),
}
