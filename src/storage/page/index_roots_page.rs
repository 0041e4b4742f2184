//! Directory of index root pages, kept at `INDEX_ROOTS_PAGE_ID`.
//!
//! The page is decoded into an owned list, edited, and encoded back in full:
//!
//! | Field        | Offset    | Size |
//! |--------------|-----------|------|
//! | magic        | 0         | 4    |
//! | entry count  | 4         | 4    |
//! | index id     | 8 + 8 * i | 4    |
//! | root page id | 12 + 8 * i| 4    |

use bytes::{Buf, BufMut};

use crate::common::{IndexId, KeystoneError, PageId, Result, PAGE_SIZE};

const MAGIC_NUMBER: u32 = 0x524F_4F54; // "ROOT"
const HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 8;

/// Number of indexes one roots page can anchor.
pub const MAX_INDEX_ROOTS: usize = (PAGE_SIZE - HEADER_SIZE) / ENTRY_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRootsPage {
    /// Sorted by index id
    roots: Vec<(IndexId, PageId)>,
}

impl IndexRootsPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a roots page. Fails with `CorruptPage` if the magic number
    /// does not match or the entry count cannot fit.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(KeystoneError::CorruptPage(
                "index roots page is truncated".into(),
            ));
        }
        let magic = data.get_u32_le();
        if magic != MAGIC_NUMBER {
            return Err(KeystoneError::CorruptPage(format!(
                "bad index roots magic {:#010x}",
                magic
            )));
        }
        let count = data.get_u32_le() as usize;
        if count > MAX_INDEX_ROOTS || data.remaining() < count * ENTRY_SIZE {
            return Err(KeystoneError::CorruptPage(format!(
                "index roots page claims {} entries",
                count
            )));
        }

        let mut roots = Vec::with_capacity(count);
        for _ in 0..count {
            let index_id = IndexId::new(data.get_u32_le());
            let root = PageId::new(data.get_u32_le());
            roots.push((index_id, root));
        }
        roots.sort_by_key(|&(index_id, _)| index_id);
        Ok(Self { roots })
    }

    /// Encodes the whole directory into `out`, zeroing the unused tail.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        let needed = HEADER_SIZE + self.roots.len() * ENTRY_SIZE;
        if self.roots.len() > MAX_INDEX_ROOTS || needed > out.len() {
            return Err(KeystoneError::DirectoryFull);
        }

        out.fill(0);
        let mut buf = &mut out[..];
        buf.put_u32_le(MAGIC_NUMBER);
        buf.put_u32_le(self.roots.len() as u32);
        for &(index_id, root) in &self.roots {
            buf.put_u32_le(index_id.as_u32());
            buf.put_u32_le(root.as_u32());
        }
        Ok(())
    }

    /// Returns true if `data` carries the roots page magic number.
    pub fn is_initialized(data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        let mut head = &data[..4];
        head.get_u32_le() == MAGIC_NUMBER
    }

    pub fn get_root(&self, index_id: IndexId) -> Option<PageId> {
        self.position(index_id)
            .ok()
            .map(|i| self.roots[i].1)
    }

    /// Adds a new entry. Returns false if the index is already present.
    pub fn insert(&mut self, index_id: IndexId, root: PageId) -> Result<bool> {
        match self.position(index_id) {
            Ok(_) => Ok(false),
            Err(_) if self.roots.len() >= MAX_INDEX_ROOTS => Err(KeystoneError::DirectoryFull),
            Err(i) => {
                self.roots.insert(i, (index_id, root));
                Ok(true)
            }
        }
    }

    /// Changes an existing entry. Returns false if the index is absent.
    pub fn update(&mut self, index_id: IndexId, root: PageId) -> bool {
        match self.position(index_id) {
            Ok(i) => {
                self.roots[i].1 = root;
                true
            }
            Err(_) => false,
        }
    }

    pub fn upsert(&mut self, index_id: IndexId, root: PageId) -> Result<()> {
        if !self.update(index_id, root) {
            self.insert(index_id, root)?;
        }
        Ok(())
    }

    /// Removes an entry. Returns false if the index is absent.
    pub fn delete(&mut self, index_id: IndexId) -> bool {
        match self.position(index_id) {
            Ok(i) => {
                self.roots.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(IndexId, PageId)> {
        self.roots.iter()
    }

    fn position(&self, index_id: IndexId) -> std::result::Result<usize, usize> {
        self.roots.binary_search_by_key(&index_id, |&(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roots_page_edit_and_reload() {
        let mut roots = IndexRootsPage::new();
        assert!(roots.insert(IndexId::new(7), PageId::new(70)).unwrap());
        assert!(roots.insert(IndexId::new(2), PageId::new(20)).unwrap());
        assert!(!roots.insert(IndexId::new(7), PageId::new(71)).unwrap());
        assert!(roots.update(IndexId::new(2), PageId::new(21)));
        assert!(!roots.update(IndexId::new(3), PageId::new(30)));
        roots.upsert(IndexId::new(3), PageId::new(30)).unwrap();
        assert!(roots.delete(IndexId::new(7)));
        assert!(!roots.delete(IndexId::new(7)));

        let mut page = [0xFFu8; PAGE_SIZE];
        roots.encode(&mut page).unwrap();
        assert!(IndexRootsPage::is_initialized(&page));
        assert_eq!(page[PAGE_SIZE - 1], 0);

        let decoded = IndexRootsPage::decode(&page).unwrap();
        assert_eq!(decoded, roots);
        assert_eq!(decoded.get_root(IndexId::new(2)), Some(PageId::new(21)));
        assert_eq!(decoded.get_root(IndexId::new(3)), Some(PageId::new(30)));
        assert_eq!(decoded.get_root(IndexId::new(7)), None);
        let ids: Vec<_> = decoded.iter().map(|&(id, _)| id.as_u32()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_index_roots_page_rejects_bad_magic() {
        let page = [0u8; PAGE_SIZE];
        assert!(!IndexRootsPage::is_initialized(&page));
        assert!(matches!(
            IndexRootsPage::decode(&page),
            Err(KeystoneError::CorruptPage(_))
        ));
    }

    #[test]
    fn test_index_roots_page_full() {
        let mut roots = IndexRootsPage::new();
        for i in 0..MAX_INDEX_ROOTS as u32 {
            roots.insert(IndexId::new(i), PageId::new(i)).unwrap();
        }
        assert!(matches!(
            roots.insert(IndexId::new(u32::MAX), PageId::new(0)),
            Err(KeystoneError::DirectoryFull)
        ));

        let mut small = [0u8; 64];
        assert!(matches!(
            roots.encode(&mut small),
            Err(KeystoneError::DirectoryFull)
        ));

        let mut page = [0u8; PAGE_SIZE];
        roots.encode(&mut page).unwrap();
        assert_eq!(IndexRootsPage::decode(&page).unwrap().len(), MAX_INDEX_ROOTS);
    }
}
