//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Buffer pool is full: all frames are pinned")]
    BufferPoolFull,

    #[error("Page {0} is not resident in the buffer pool")]
    PageNotFound(PageId),

    #[error("Invalid page: {0}")]
    InvalidPage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
