use std::cmp::Ordering;
use std::sync::Arc;

use crate::buffer::BufferPoolManager;
use crate::common::{KeystoneError, PageId, RecordId, Result, INVALID_PAGE_ID};

use super::btree_leaf_page::BTreeLeafPage;
use super::btree_page::{BTreePage, BTreePageKind};
use super::KeyManager;

/// Forward cursor over the leaf chain.
///
/// Only the leaf being read is pinned, and only for the duration of one
/// step, so an iterator never blocks writers between calls. Entries added
/// or moved by concurrent writers may or may not be observed.
pub struct BTreeIterator<K: KeyManager> {
    bpm: Arc<BufferPoolManager>,
    key_manager: Arc<K>,
    current_page_id: PageId,
    current_index: usize,
    end_key: Option<Vec<u8>>,
    done: bool,
}

impl<K: KeyManager> BTreeIterator<K> {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        key_manager: Arc<K>,
        start_page_id: PageId,
        start_index: usize,
        end_key: Option<Vec<u8>>,
    ) -> Self {
        Self {
            bpm,
            key_manager,
            current_page_id: start_page_id,
            current_index: start_index,
            end_key,
            done: start_page_id == INVALID_PAGE_ID,
        }
    }

    pub fn is_end(&self) -> bool {
        self.done
    }

    pub fn next_entry(&mut self) -> Result<Option<(K::Key, RecordId)>> {
        while !self.done && self.current_page_id != INVALID_PAGE_ID {
            let guard = self.bpm.fetch_page_read(self.current_page_id)?;
            if BTreePage::new(guard.data()).kind()? != BTreePageKind::Leaf {
                return Err(KeystoneError::IndexCorrupted(format!(
                    "leaf chain reached non-leaf {}",
                    self.current_page_id
                )));
            }
            let leaf = BTreeLeafPage::new(guard.data());

            if self.current_index < leaf.size() {
                let key = leaf.key_at(self.current_index);
                if let Some(end) = &self.end_key {
                    if self.key_manager.compare(key, end) == Ordering::Greater {
                        self.done = true;
                        return Ok(None);
                    }
                }

                let entry = (
                    self.key_manager.deserialize(key),
                    leaf.value_at(self.current_index),
                );
                self.current_index += 1;
                return Ok(Some(entry));
            }

            self.current_page_id = leaf.next_page_id();
            self.current_index = 0;
        }

        self.done = true;
        Ok(None)
    }
}

impl<K: KeyManager> Iterator for BTreeIterator<K> {
    type Item = Result<(K::Key, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
