use std::io;
use thiserror::Error;

use crate::file::FileError;

/// Errors that can occur in the blob file store
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("Invalid blob handle: {0}")]
    InvalidHandle(u32),

    #[error("Corrupted blob store: {0}")]
    Corrupted(String),

    #[error("Block size mismatch: configured {expected}, file uses {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),

    #[error("Blob store has been disposed")]
    Disposed,
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Blob streams report failures through `std::io`
impl From<BlobError> for io::Error {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::File(FileError::Io(e)) => e,
            other => io::Error::other(other),
        }
    }
}
