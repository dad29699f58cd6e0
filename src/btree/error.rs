use thiserror::Error;

use crate::file::{FileError, PageId};

/// Errors that can occur during B-tree operations
#[derive(Debug, Error)]
pub enum BTreeError {
    #[error("File error: {0}")]
    File(#[from] FileError),

    #[error("B-tree is not open")]
    NotOpen,

    #[error("B-tree is already open")]
    AlreadyOpen,

    #[error("Corrupted page {page_id}: {reason}")]
    CorruptedPage { page_id: PageId, reason: String },

    #[error("Invalid tree header: {0}")]
    InvalidHeader(String),

    #[error("Invalid tree state: {0}")]
    InvalidState(String),

    #[error("Invalid page size {page_size} for {key_size}-byte keys")]
    InvalidPageSize { page_size: usize, key_size: usize },
}

impl BTreeError {
    pub(crate) fn corrupted(page_id: PageId, reason: impl Into<String>) -> Self {
        BTreeError::CorruptedPage {
            page_id,
            reason: reason.into(),
        }
    }
}

pub type BTreeResult<T> = Result<T, BTreeError>;
