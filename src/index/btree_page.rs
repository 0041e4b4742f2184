//! Header shared by B+ tree leaf and internal pages.
//!
//! | Field          | Offset | Size |
//! |----------------|--------|------|
//! | page type      | 0      | 4    |
//! | page id        | 4      | 4    |
//! | parent page id | 8      | 4    |
//! | size           | 12     | 4    |
//! | max size       | 16     | 4    |
//! | key size       | 20     | 4    |
//!
//! Leaf pages append the next leaf page id at offset 24.

use crate::common::{KeystoneError, PageId, Result};

const LEAF_PAGE_TYPE: u32 = 0x4C45_4146; // "LEAF"
const INTERNAL_PAGE_TYPE: u32 = 0x494E_5452; // "INTR"

const PAGE_TYPE_OFFSET: usize = 0;
const PAGE_ID_OFFSET: usize = 4;
const PARENT_OFFSET: usize = 8;
const SIZE_OFFSET: usize = 12;
const MAX_SIZE_OFFSET: usize = 16;
const KEY_SIZE_OFFSET: usize = 20;

pub(crate) const COMMON_HEADER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BTreePageKind {
    Leaf,
    Internal,
}

impl BTreePageKind {
    fn tag(self) -> u32 {
        match self {
            BTreePageKind::Leaf => LEAF_PAGE_TYPE,
            BTreePageKind::Internal => INTERNAL_PAGE_TYPE,
        }
    }
}

/// View over the common header of a tree page.
pub struct BTreePage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> BTreePage<B> {
    pub fn new(data: B) -> Self {
        assert!(data.as_ref().len() >= COMMON_HEADER_SIZE);
        Self { data }
    }

    /// Decodes the page type tag.
    pub fn kind(&self) -> Result<BTreePageKind> {
        match self.read_u32(PAGE_TYPE_OFFSET) {
            LEAF_PAGE_TYPE => Ok(BTreePageKind::Leaf),
            INTERNAL_PAGE_TYPE => Ok(BTreePageKind::Internal),
            other => Err(KeystoneError::CorruptPage(format!(
                "{} has unknown tree page type {:#010x}",
                self.page_id(),
                other
            ))),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.read_u32(PAGE_TYPE_OFFSET) == LEAF_PAGE_TYPE
    }

    pub fn page_id(&self) -> PageId {
        PageId::new(self.read_u32(PAGE_ID_OFFSET))
    }

    pub fn parent_page_id(&self) -> PageId {
        PageId::new(self.read_u32(PARENT_OFFSET))
    }

    pub fn is_root(&self) -> bool {
        self.parent_page_id() == crate::common::INVALID_PAGE_ID
    }

    /// Number of entries. For internal pages this counts children.
    pub fn size(&self) -> usize {
        self.read_u32(SIZE_OFFSET) as usize
    }

    pub fn max_size(&self) -> usize {
        self.read_u32(MAX_SIZE_OFFSET) as usize
    }

    /// Minimum occupancy of a non-root page, `ceil(max_size / 2)`.
    pub fn min_size(&self) -> usize {
        (self.max_size() + 1) / 2
    }

    pub fn key_size(&self) -> usize {
        self.read_u32(KEY_SIZE_OFFSET) as usize
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub(crate) fn read_u32(&self, offset: usize) -> u32 {
        let bytes: [u8; 4] = self.data.as_ref()[offset..offset + 4]
            .try_into()
            .expect("slice is 4 bytes");
        u32::from_le_bytes(bytes)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BTreePage<B> {
    pub(crate) fn init_header(
        &mut self,
        kind: BTreePageKind,
        page_id: PageId,
        parent_page_id: PageId,
        max_size: usize,
        key_size: usize,
    ) {
        self.write_u32(PAGE_TYPE_OFFSET, kind.tag());
        self.write_u32(PAGE_ID_OFFSET, page_id.as_u32());
        self.write_u32(PARENT_OFFSET, parent_page_id.as_u32());
        self.write_u32(SIZE_OFFSET, 0);
        self.write_u32(MAX_SIZE_OFFSET, max_size as u32);
        self.write_u32(KEY_SIZE_OFFSET, key_size as u32);
    }

    pub fn set_parent_page_id(&mut self, parent_page_id: PageId) {
        self.write_u32(PARENT_OFFSET, parent_page_id.as_u32());
    }

    pub fn set_size(&mut self, size: usize) {
        self.write_u32(SIZE_OFFSET, size as u32);
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    pub(crate) fn write_u32(&mut self, offset: usize, value: u32) {
        self.data.as_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{INVALID_PAGE_ID, PAGE_SIZE};

    #[test]
    fn test_btree_page_header() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = BTreePage::new(&mut data[..]);
        assert!(matches!(page.kind(), Err(KeystoneError::CorruptPage(_))));

        page.init_header(BTreePageKind::Internal, PageId::new(3), INVALID_PAGE_ID, 5, 8);
        page.set_size(2);
        assert_eq!(page.kind().unwrap(), BTreePageKind::Internal);
        assert!(!page.is_leaf());
        assert!(page.is_root());
        assert_eq!(page.page_id(), PageId::new(3));
        assert_eq!(page.size(), 2);
        assert_eq!(page.max_size(), 5);
        assert_eq!(page.min_size(), 3);
        assert_eq!(page.key_size(), 8);

        page.set_parent_page_id(PageId::new(1));
        assert!(!page.is_root());
    }
}
