use thiserror::Error;

use super::types::PageId;

/// Storage core error types
#[derive(Error, Debug)]
pub enum KeystoneError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Buffer pool is full, no free or evictable frames available")]
    CacheExhausted,

    #[error("Page {0} is still pinned")]
    PageInUse(PageId),

    #[error("Disk could not allocate a new page")]
    AllocationFailed,

    #[error("Corrupt page: {0}")]
    CorruptPage(String),

    #[error("Index roots page is full")]
    DirectoryFull,

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),
}

pub type Result<T> = std::result::Result<T, KeystoneError>;
