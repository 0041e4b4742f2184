use super::types::PageId;

/// Size of a page in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// Invalid page ID constant
pub const INVALID_PAGE_ID: PageId = PageId(u32::MAX);

/// Logical page that anchors the root page id of every index.
/// It is the first page handed out on a fresh database file.
pub const INDEX_ROOTS_PAGE_ID: PageId = PageId(0);
