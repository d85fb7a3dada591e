use cidgraph_graph::{Cid, CidParseError, CodecError, GraphError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("block {0} not found")]
    NotFound(Cid),
    #[error("block {cid} failed integrity check: stored bytes do not hash to its CID")]
    Integrity { cid: Cid },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("another transaction is already writing")]
    WriterBusy,
    #[error("invalid CID: {0}")]
    InvalidCid(#[from] CidParseError),
    #[error("commit log {path}: {message}")]
    CommitLog { path: PathBuf, message: String },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Underlying graph error, whether raised directly or while decoding.
    pub fn as_graph_error(&self) -> Option<&GraphError> {
        match self {
            StorageError::Graph(e) | StorageError::Codec(CodecError::Graph(e)) => Some(e),
            _ => None,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
